//! Deterministic token-bounded chunker.
//!
//! Splits Markdown into ordered blocks on headings and blank lines, then
//! greedily packs blocks into chunks bounded by `max_tokens`. Fenced code
//! blocks (``` or ~~~) are atomic: a chunk boundary never falls inside one,
//! even when the block alone exceeds the budget. Token counts are
//! approximated by whitespace-split length; the tokenizer identity is
//! recorded in the embed manifest so identical identity guarantees
//! identical counts.
//!
//! Chunking is a pure function of (input text, config): the same inputs
//! produce byte-identical `chunks.ndjson` files on independent runs.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;

use crate::artifacts;
use crate::config::{ChunkingConfig, Config};
use crate::events::{EventEmitter, EventFields};
use crate::models::{ChunkRecord, EnrichedDoc, NormalizedDoc, Traceability};

/// Bumped whenever the splitting or packing algorithm changes.
pub const CHUNKER_VERSION: &str = "v1";

/// Baseline tokenizer identity recorded in the manifest.
pub const TOKENIZER_NAME: &str = "whitespace";
pub const TOKENIZER_VERSION: &str = "1";

/// A chunk produced by [`chunk_document`], before traceability is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub ord: i64,
    pub text_md: String,
    pub char_count: i64,
    pub token_count: i64,
    /// True when the chunk's token count exceeds `max_tokens` (an
    /// indivisible block, notably a fenced code block, forced it over).
    pub overflow: bool,
}

/// Normalize text for consistent chunking: CRLF→LF, collapse runs of more
/// than two newlines, trim outer whitespace.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out.trim().to_string()
}

pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn is_heading(line: &str) -> bool {
    let mut chars = line.chars();
    let mut hashes = 0;
    for ch in chars.by_ref() {
        match ch {
            '#' => hashes += 1,
            ' ' | '\t' => return hashes >= 1 && hashes <= 6,
            _ => return false,
        }
    }
    false
}

/// Split normalized text into ordered blocks.
///
/// Blank lines end the current block. When `prefer_headings` is set, a
/// heading line is emitted as its own block. Lines inside a fenced code
/// block never break, and the whole fence lands in a single block.
pub fn split_blocks(text: &str, prefer_headings: bool) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut fence: Option<&'static str> = None;

    let flush = |current: &mut Vec<&str>, blocks: &mut Vec<String>| {
        if !current.is_empty() {
            let block = current.join("\n").trim().to_string();
            if !block.is_empty() {
                blocks.push(block);
            }
            current.clear();
        }
    };

    for line in text.lines() {
        if let Some(open) = fence {
            current.push(line);
            if fence_marker(line) == Some(open) {
                fence = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(line) {
            current.push(line);
            fence = Some(marker);
            continue;
        }

        if line.trim().is_empty() {
            flush(&mut current, &mut blocks);
        } else if prefer_headings && is_heading(line) {
            flush(&mut current, &mut blocks);
            blocks.push(line.trim().to_string());
        } else {
            current.push(line);
        }
    }
    flush(&mut current, &mut blocks);

    blocks
}

/// Overlap tail: the trailing `overlap_pct` of the flushed text, cut at a
/// word boundary where one exists in the second half of the window.
fn overlap_tail(text: &str, overlap_pct: f64) -> Option<String> {
    if overlap_pct <= 0.0 {
        return None;
    }
    let chars: Vec<char> = text.chars().collect();
    let overlap_chars = (chars.len() as f64 * overlap_pct) as usize;
    if overlap_chars == 0 {
        return None;
    }
    let window: String = chars[chars.len() - overlap_chars..].iter().collect();
    let tail = match window.rfind(' ') {
        Some(pos) if pos > overlap_chars / 2 => window[pos + 1..].to_string(),
        _ => window,
    };
    if tail.trim().is_empty() {
        None
    } else {
        Some(tail)
    }
}

fn make_chunk(doc_id: &str, ord: i64, text: &str, max_tokens: usize) -> Chunk {
    let text = text.trim();
    let tokens = token_count(text) as i64;
    Chunk {
        chunk_id: format!("{}:{:04}", doc_id, ord),
        ord,
        text_md: text.to_string(),
        char_count: text.chars().count() as i64,
        token_count: tokens,
        overflow: tokens > max_tokens as i64,
    }
}

/// Chunk a document into token-bounded pieces with stable chunk ids.
///
/// The title, when present and the body does not already open with a
/// heading, is prepended as an `# H1` so the first chunk carries it.
pub fn chunk_document(
    doc_id: &str,
    text_md: &str,
    title: &str,
    cfg: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut full_text = normalize_text(text_md);
    let title = title.trim();
    if !title.is_empty() && !full_text.starts_with('#') {
        if full_text.is_empty() {
            full_text = format!("# {}", title);
        } else {
            full_text = format!("# {}\n\n{}", title, full_text);
        }
    }
    if full_text.is_empty() {
        return Vec::new();
    }

    let blocks = split_blocks(&full_text, cfg.prefer_headings);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut acc = String::new();
    let mut acc_tokens = 0usize;
    let mut ord: i64 = 0;

    for block in &blocks {
        let block_tokens = token_count(block);

        if !acc.is_empty()
            && acc_tokens + block_tokens > cfg.max_tokens
            && acc_tokens >= cfg.min_tokens
        {
            chunks.push(make_chunk(doc_id, ord, &acc, cfg.max_tokens));
            let flushed = std::mem::take(&mut acc);
            ord += 1;

            if let Some(tail) = overlap_tail(&flushed, cfg.overlap_pct) {
                acc = format!("{}\n\n{}", tail, block);
            } else {
                acc = block.clone();
            }
            acc_tokens = token_count(&acc);
            continue;
        }

        if acc.is_empty() {
            acc = block.clone();
            acc_tokens = block_tokens;
        } else {
            acc.push_str("\n\n");
            acc.push_str(block);
            acc_tokens += block_tokens;
        }
    }

    if !acc.trim().is_empty() {
        chunks.push(make_chunk(doc_id, ord, &acc, cfg.max_tokens));
    }

    chunks
}

/// Statistics returned by [`chunk_run`] and written to the assurance report.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkStats {
    pub run_id: String,
    pub docs_total: u64,
    pub docs_empty: u64,
    pub chunks_total: u64,
    pub parse_errors: u64,
    pub atomic_overflows: u64,
    pub token_min: i64,
    pub token_max: i64,
    pub token_avg: f64,
    pub token_total: i64,
    pub quality_distribution: HashMap<String, u64>,
    pub completed_at: String,
}

/// Chunk every document of a run: read the normalized artifact (joined with
/// enrichment output when present), write `chunk/chunks.ndjson` and
/// `chunk/chunk_assurance.json`.
pub fn chunk_run(config: &Config, run_id: &str, emitter: &mut EventEmitter) -> Result<ChunkStats> {
    let workroot = &config.workspace.workroot;
    let started = std::time::Instant::now();
    emitter.start("chunk.run");

    let normalized_path =
        artifacts::phase_dir(workroot, run_id, "normalize").join("normalized.ndjson");
    if !normalized_path.exists() {
        let reason = format!("Missing input artifact: {}", normalized_path.display());
        emitter.fail("chunk.run", &reason, started.elapsed().as_millis() as u64);
        bail!(reason);
    }

    let (docs, parse_errors): (Vec<NormalizedDoc>, usize) =
        artifacts::read_ndjson_lossy(&normalized_path)?;

    // Enrichment output is optional input here; when present its quality
    // scores are forwarded into the chunk assurance report.
    let enriched_path = artifacts::phase_dir(workroot, run_id, "enrich").join("enriched.jsonl");
    let enriched_by_id: HashMap<String, EnrichedDoc> = if enriched_path.exists() {
        let (enriched, _): (Vec<EnrichedDoc>, usize) =
            artifacts::read_ndjson_lossy(&enriched_path)?;
        enriched.into_iter().map(|e| (e.id.clone(), e)).collect()
    } else {
        HashMap::new()
    };

    let chunk_dir = artifacts::phase_dir(workroot, run_id, "chunk");
    let mut writer = artifacts::NdjsonWriter::create(&chunk_dir.join("chunks.ndjson"))?;

    let mut stats = ChunkStats {
        run_id: run_id.to_string(),
        docs_total: 0,
        docs_empty: 0,
        chunks_total: 0,
        parse_errors: parse_errors as u64,
        atomic_overflows: 0,
        token_min: i64::MAX,
        token_max: 0,
        token_avg: 0.0,
        token_total: 0,
        quality_distribution: HashMap::new(),
        completed_at: String::new(),
    };

    for doc in &docs {
        stats.docs_total += 1;
        let chunks = chunk_document(&doc.id, &doc.text_md, &doc.title, &config.chunking);
        if chunks.is_empty() {
            stats.docs_empty += 1;
            continue;
        }

        if let Some(enriched) = enriched_by_id.get(&doc.id) {
            let bucket = if enriched.quality_score < config.enrich.min_quality {
                "below_threshold"
            } else {
                "ok"
            };
            *stats.quality_distribution.entry(bucket.to_string()).or_insert(0) += 1;
        }

        for chunk in &chunks {
            if chunk.overflow {
                stats.atomic_overflows += 1;
                emitter.emit(
                    crate::events::Level::Warning,
                    "chunk.overflow",
                    crate::events::Status::Ok,
                    EventFields {
                        doc_id: Some(doc.id.clone()),
                        chunk_id: Some(chunk.chunk_id.clone()),
                        ..Default::default()
                    },
                );
            }
            stats.token_min = stats.token_min.min(chunk.token_count);
            stats.token_max = stats.token_max.max(chunk.token_count);
            stats.token_total += chunk.token_count;
            stats.chunks_total += 1;

            let record = ChunkRecord {
                chunk_id: chunk.chunk_id.clone(),
                doc_id: doc.id.clone(),
                ord: chunk.ord,
                text_md: chunk.text_md.clone(),
                char_count: chunk.char_count,
                token_count: chunk.token_count,
                content_hash: Some(artifacts::sha256_hex(chunk.text_md.as_bytes())),
                traceability: Traceability {
                    title: doc.title.clone(),
                    url: doc.url.clone(),
                    source_system: doc.source_system.clone(),
                },
            };
            writer.write(&record)?;
        }
        emitter.add_counts(1, chunks.len() as u64, chunks.iter().map(|c| c.token_count as u64).sum());
    }
    writer.finish()?;

    if stats.chunks_total == 0 {
        stats.token_min = 0;
    }
    stats.token_avg = if stats.chunks_total > 0 {
        stats.token_total as f64 / stats.chunks_total as f64
    } else {
        0.0
    };
    stats.completed_at = artifacts::now_iso();

    artifacts::write_json_report(&chunk_dir.join("chunk_assurance.json"), &stats)
        .context("Failed to write chunk assurance")?;

    emitter.end("chunk.run", started.elapsed().as_millis() as u64);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_tokens: usize, min_tokens: usize, overlap_pct: f64) -> ChunkingConfig {
        ChunkingConfig {
            max_tokens,
            min_tokens,
            prefer_headings: true,
            overlap_pct,
        }
    }

    const SMALL_DOC: &str = "# Title\nAlpha beta gamma.\n\n## H2\ndelta epsilon.\n\n```python\nx = 1\n```";

    #[test]
    fn test_small_doc_three_chunks() {
        let chunks = chunk_document("doc", SMALL_DOC, "", &cfg(5, 1, 0.0));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_id, "doc:0000");
        assert_eq!(chunks[0].text_md, "# Title\n\nAlpha beta gamma.");
        assert_eq!(chunks[1].chunk_id, "doc:0001");
        assert_eq!(chunks[1].text_md, "## H2\n\ndelta epsilon.");
        assert_eq!(chunks[2].chunk_id, "doc:0002");
        assert_eq!(chunks[2].text_md, "```python\nx = 1\n```");
    }

    #[test]
    fn test_deterministic() {
        let a = chunk_document("doc", SMALL_DOC, "", &cfg(5, 1, 0.0));
        let b = chunk_document("doc", SMALL_DOC, "", &cfg(5, 1, 0.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_ord_contiguous() {
        let text = (0..60)
            .map(|i| format!("Paragraph number {} with several extra words.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_document("doc", &text, "", &cfg(20, 5, 0.0));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ord, i as i64);
            assert_eq!(c.chunk_id, format!("doc:{:04}", i));
        }
    }

    #[test]
    fn test_fence_never_split() {
        let code_lines = (0..100)
            .map(|i| format!("let x{} = {};", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!("Intro paragraph here.\n\n```rust\n{}\n```\n\nOutro.", code_lines);
        let chunks = chunk_document("doc", &text, "", &cfg(10, 1, 0.0));
        // The whole fence must land in exactly one chunk.
        let holders: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| c.text_md.contains("let x0 ="))
            .collect();
        assert_eq!(holders.len(), 1);
        assert!(holders[0].text_md.contains("let x99 ="));
        assert!(holders[0].overflow);
        // No chunk contains an odd number of fence markers.
        for c in &chunks {
            assert_eq!(c.text_md.matches("```").count() % 2, 0, "split fence: {}", c.text_md);
        }
    }

    #[test]
    fn test_blank_lines_inside_fence_do_not_break() {
        let text = "```\nfirst\n\nsecond\n```";
        let blocks = split_blocks(&normalize_text(text), true);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], text);
    }

    #[test]
    fn test_title_prepended_when_body_has_no_heading() {
        let chunks = chunk_document("doc", "Body text only.", "My Page", &cfg(800, 1, 0.0));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text_md.starts_with("# My Page\n\n"));
    }

    #[test]
    fn test_title_not_duplicated() {
        let chunks = chunk_document("doc", "# My Page\n\nBody.", "My Page", &cfg(800, 1, 0.0));
        assert_eq!(chunks[0].text_md.matches("# My Page").count(), 1);
    }

    #[test]
    fn test_empty_doc_yields_no_chunks() {
        assert!(chunk_document("doc", "", "", &cfg(800, 120, 0.15)).is_empty());
        assert!(chunk_document("doc", "  \n\n  ", "", &cfg(800, 120, 0.15)).is_empty());
    }

    #[test]
    fn test_overlap_tail_prepended() {
        let text = (0..40)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
            + "\n\n"
            + &(40..80).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = chunk_document("doc", &text, "", &cfg(40, 10, 0.2));
        assert_eq!(chunks.len(), 2);
        // The second chunk starts with a tail of the first.
        assert!(chunks[1].text_md.contains("word39"));
        assert!(chunks[1].text_md.contains("word40"));
    }

    #[test]
    fn test_normalize_collapses_blank_runs() {
        assert_eq!(normalize_text("a\r\nb\n\n\n\nc"), "a\nb\n\nc");
    }

    #[test]
    fn test_headings_ignored_when_not_preferred(){
        let text = "# One\ntwo\n\nthree";
        let blocks = split_blocks(text, false);
        assert_eq!(blocks, vec!["# One\ntwo".to_string(), "three".to_string()]);
    }
}
