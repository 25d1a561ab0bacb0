//! Context packing: select and format ranked chunks into one
//! character-bounded string.
//!
//! Packing never truncates inside a fenced code block. When a truncation
//! boundary would fall inside a fence, the cut is walked back to the last
//! fence-balanced line; if no meaningful prefix fits, the remainder is
//! omitted — except for the very first chunk, which is emitted complete
//! even over budget so a retrieval is never empty on account of one large
//! code block.

use serde::Serialize;

use crate::retrieve::{SearchHit, Timing};

/// Keep at most `max_chunks_per_doc` hits per document, preserving rank
/// order.
pub fn group_by_doc(hits: &[SearchHit], max_chunks_per_doc: usize) -> Vec<SearchHit> {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    let mut result = Vec::new();
    for hit in hits {
        let count = counts.entry(hit.doc_id.as_str()).or_insert(0);
        if *count < max_chunks_per_doc {
            *count += 1;
            result.push(hit.clone());
        }
    }
    result
}

fn separator(index: usize, hit: &SearchHit) -> String {
    let mut sep = format!("\n\n--- Chunk {} (score: {:.3}) ---\n", index + 1, hit.score);
    if !hit.title.is_empty() {
        sep.push_str(&format!("Title: {}\n", hit.title));
    }
    if !hit.url.is_empty() {
        sep.push_str(&format!("URL: {}\n", hit.url));
    }
    sep.push('\n');
    sep
}

fn is_fence_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// True when every fence opened in `text` is closed again.
fn fences_balanced(text: &str) -> bool {
    text.lines().filter(|l| is_fence_line(l)).count() % 2 == 0
}

const TRUNCATION_MARKER: &str = "\n[... truncated]";
const MIN_USEFUL_CHARS: usize = 20;

/// Largest meaningful prefix of `text` within `allowed` characters that
/// does not end inside a fenced code block. Returns `None` when nothing
/// useful fits.
fn truncate_safely(text: &str, allowed: usize) -> Option<String> {
    if allowed <= MIN_USEFUL_CHARS {
        return None;
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= allowed {
        return Some(text.to_string());
    }
    let candidate: String = chars[..allowed].iter().collect();

    if !text.lines().any(is_fence_line) {
        // No fences anywhere: cut at the last word boundary.
        let cut = candidate
            .rfind(char::is_whitespace)
            .unwrap_or(candidate.len());
        let prefix = candidate[..cut].trim_end();
        if prefix.chars().count() > MIN_USEFUL_CHARS {
            return Some(prefix.to_string());
        }
        return None;
    }

    // Walk back line by line until the prefix closes every fence it opens.
    let mut cut = candidate.len();
    loop {
        let prefix = candidate[..cut].trim_end();
        if prefix.chars().count() <= MIN_USEFUL_CHARS {
            return None;
        }
        if fences_balanced(prefix) {
            return Some(prefix.to_string());
        }
        match candidate[..cut].rfind('\n') {
            Some(pos) if pos > 0 => cut = pos,
            _ => return None,
        }
    }
}

/// Pack hits into a context string within `max_chars`, returning the string
/// and the hits that contributed to it.
///
/// The result is either at most `max_chars` characters, or contains exactly
/// one complete over-budget chunk (the first, when it cannot be truncated
/// without splitting a fence).
pub fn pack_context(hits: &[SearchHit], max_chars: usize) -> (String, Vec<SearchHit>) {
    if hits.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut parts: Vec<String> = Vec::new();
    let mut selected: Vec<SearchHit> = Vec::new();
    let mut used = 0usize;

    for (i, hit) in hits.iter().enumerate() {
        let sep = separator(i, hit);
        let full_len = sep.chars().count() + hit.text_md.chars().count();

        if used + full_len <= max_chars {
            parts.push(sep);
            parts.push(hit.text_md.clone());
            selected.push(hit.clone());
            used += full_len;
            continue;
        }

        // Over budget: try a safe truncation of this chunk, then stop.
        let remaining = max_chars.saturating_sub(used);
        let overhead = sep.chars().count() + TRUNCATION_MARKER.chars().count();
        if remaining > overhead {
            if let Some(prefix) = truncate_safely(&hit.text_md, remaining - overhead) {
                parts.push(sep);
                parts.push(prefix);
                parts.push(TRUNCATION_MARKER.to_string());
                selected.push(hit.clone());
                break;
            }
        }

        // Nothing useful fits. An empty context helps nobody: emit the
        // first chunk complete even though it exceeds the budget.
        if selected.is_empty() {
            parts.push(sep);
            parts.push(hit.text_md.clone());
            selected.push(hit.clone());
        }
        break;
    }

    (parts.concat(), selected)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalSummary {
    pub total_hits: usize,
    pub unique_documents: usize,
    pub total_characters: usize,
    pub score_stats: ScoreStats,
    pub timing: Timing,
}

/// Summarize a hit list for the retrieval response.
pub fn summarize(hits: &[SearchHit], timing: &Timing) -> RetrievalSummary {
    let doc_ids: std::collections::HashSet<&str> =
        hits.iter().map(|h| h.doc_id.as_str()).collect();
    let scores: Vec<f64> = hits.iter().map(|h| h.score).collect();

    RetrievalSummary {
        total_hits: hits.len(),
        unique_documents: doc_ids.len(),
        total_characters: hits.iter().map(|h| h.text_md.chars().count()).sum(),
        score_stats: ScoreStats {
            min: if scores.is_empty() {
                0.0
            } else {
                scores.iter().cloned().fold(f64::INFINITY, f64::min)
            },
            max: if scores.is_empty() {
                0.0
            } else {
                scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            },
            avg: if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            },
        },
        timing: timing.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, doc_id: &str, score: f64, text: &str) -> SearchHit {
        SearchHit {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            title: "Doc Title".to_string(),
            url: "https://example.test/page".to_string(),
            source_system: "confluence".to_string(),
            text_md: text.to_string(),
            score,
            boost_applied: None,
            dense_rank: None,
            bm25_rank: None,
            rrf_score: None,
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_group_by_doc_limits() {
        let hits = vec![
            hit("d1:0000", "d1", 0.9, "a"),
            hit("d1:0001", "d1", 0.8, "b"),
            hit("d1:0002", "d1", 0.7, "c"),
            hit("d2:0000", "d2", 0.6, "d"),
        ];
        let grouped = group_by_doc(&hits, 2);
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[2].doc_id, "d2");
    }

    #[test]
    fn test_pack_within_budget() {
        let hits = vec![
            hit("c1", "d1", 0.9, &words(20)),
            hit("c2", "d2", 0.8, &words(20)),
        ];
        let (context, selected) = pack_context(&hits, 10_000);
        assert_eq!(selected.len(), 2);
        assert!(context.chars().count() <= 10_000);
        assert!(context.contains("--- Chunk 1"));
        assert!(context.contains("--- Chunk 2"));
        assert!(context.contains("Title: Doc Title"));
        assert!(context.contains("word19"));
    }

    #[test]
    fn test_pack_truncates_at_budget() {
        let hits = vec![
            hit("c1", "d1", 0.9, &words(30)),
            hit("c2", "d2", 0.8, &words(500)),
        ];
        let (context, selected) = pack_context(&hits, 600);
        assert!(context.chars().count() <= 600, "len = {}", context.chars().count());
        assert_eq!(selected.len(), 2);
        assert!(context.contains("[... truncated]"));
    }

    #[test]
    fn test_pack_never_cuts_inside_fence() {
        let code = format!("intro line\n\n```\n{}\n```\nafter", words(400));
        let hits = vec![hit("c1", "d1", 0.9, &code), hit("c2", "d2", 0.8, &words(50))];
        let (context, _) = pack_context(&hits, 500);
        // Either the fence was dropped entirely or it is closed.
        assert_eq!(context.matches("```").count() % 2, 0, "context: {}", context);
    }

    #[test]
    fn test_pack_first_chunk_emitted_complete_when_untruncatable() {
        // One chunk that is a single giant fence: cannot be cut safely.
        let code = format!("```\n{}\n```", words(300));
        let hits = vec![hit("c1", "d1", 0.9, &code)];
        let (context, selected) = pack_context(&hits, 100);
        // Over budget but complete, exactly one chunk.
        assert_eq!(selected.len(), 1);
        assert!(context.contains("word299"));
        assert_eq!(context.matches("```").count(), 2);
    }

    #[test]
    fn test_pack_empty_hits() {
        let (context, selected) = pack_context(&[], 1000);
        assert!(context.is_empty());
        assert!(selected.is_empty());
    }

    #[test]
    fn test_summarize_stats() {
        let hits = vec![
            hit("c1", "d1", 0.2, "abcde"),
            hit("c2", "d1", 0.6, "fghij"),
            hit("c3", "d2", 1.0, "klmno"),
        ];
        let timing = Timing {
            embed_ms: 1,
            dense_ms: 2,
            bm25_ms: 3,
            total_ms: 6,
        };
        let summary = summarize(&hits, &timing);
        assert_eq!(summary.total_hits, 3);
        assert_eq!(summary.unique_documents, 2);
        assert_eq!(summary.total_characters, 15);
        assert!((summary.score_stats.min - 0.2).abs() < 1e-9);
        assert!((summary.score_stats.max - 1.0).abs() < 1e-9);
        assert!((summary.score_stats.avg - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_truncate_safely_word_boundary() {
        let text = words(100);
        let prefix = truncate_safely(&text, 50).unwrap();
        assert!(prefix.chars().count() <= 50);
        assert!(!prefix.ends_with(' '));
        // Cut lands between words, not inside one.
        assert!(text.starts_with(&prefix));
        let next_char = text.chars().nth(prefix.chars().count()).unwrap();
        assert!(next_char.is_whitespace());
    }
}
