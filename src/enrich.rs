//! Document enrichment: deterministic rule-based metadata, an optional
//! bounded LLM-style overlay, and per-document fingerprints.
//!
//! Rule-based fields are a pure function of the normalized record, so two
//! independent runs over the same input produce identical enriched records
//! and identical fingerprints. The fingerprint covers exactly the fields
//! that should trigger re-embedding when changed.
//!
//! Quality gating here is advisory: the enricher reports the fraction of
//! documents below the quality threshold but never blocks a run.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::artifacts;
use crate::config::Config;
use crate::events::{EventEmitter, EventFields, Level, Status};
use crate::models::{EnrichedDoc, FingerprintRecord, NormalizedDoc, Readability, SuggestedEdge};

/// Bumped whenever enrichment rules change; part of every fingerprint.
pub const ENRICHMENT_VERSION: &str = "v1";

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#+\s").unwrap());
static IMAGE_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]").unwrap());
static LINK_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").unwrap());
static BROKEN_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\(\s*\)|\[[^\]]*\]\(#\)").unwrap());
static TAG_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\-]").unwrap());
static MD_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[#*`\[\]()_]").unwrap());
static BLANK_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());
static CAP_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+\b").unwrap());
static TECH_TERM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(API|JSON|XML|HTML|CSS|JavaScript|Python|Java|SQL|REST|HTTPS?|URL|UUID|ID)\b")
        .unwrap()
});
static WORD4_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w{4,}\b").unwrap());

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Collection assignment: keep an existing collection, else the lowercased
/// space key, else the source system.
fn extract_collection(doc: &NormalizedDoc) -> String {
    if let Some(ref c) = doc.collection {
        if !c.is_empty() {
            return c.clone();
        }
    }
    if let Some(ref key) = doc.space_key {
        if !key.is_empty() {
            return key.to_lowercase();
        }
    }
    if doc.source_system.is_empty() {
        "unknown".to_string()
    } else {
        doc.source_system.clone()
    }
}

/// Path tags from breadcrumbs, URL structure, and content signals.
fn extract_path_tags(doc: &NormalizedDoc) -> Vec<String> {
    if let Some(ref tags) = doc.path_tags {
        if !tags.is_empty() {
            return tags.clone();
        }
    }

    let mut tags: Vec<String> = Vec::new();
    let mut push_unique = |tags: &mut Vec<String>, tag: String| {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    if let Some(ref crumbs) = doc.breadcrumbs {
        // Exclude the final crumb: that is the page title itself.
        for crumb in crumbs.iter().take(crumbs.len().saturating_sub(1)) {
            let tag = TAG_STRIP_RE
                .replace_all(&crumb.to_lowercase().replace(' ', "-"), "")
                .to_string();
            if tag.len() > 2 {
                push_unique(&mut tags, tag);
            }
        }
    }

    if doc.url.contains("/pages/") {
        if let Some(rest) = doc.url.split("/spaces/").nth(1) {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() > 2 {
                push_unique(&mut tags, parts[0].to_lowercase());
            }
        }
    }

    for (needle, tag) in [
        ("API", "api"),
        ("Installation", "installation"),
        ("Configuration", "configuration"),
    ] {
        let h1 = format!("# {}", needle);
        let h2 = format!("## {}", needle);
        if doc.text_md.contains(&h1) || doc.text_md.contains(&h2) {
            push_unique(&mut tags, tag.to_string());
        }
    }

    tags
}

/// Readability metrics on markdown-stripped text; denominators zero-guarded.
pub fn compute_readability(text_md: &str) -> Readability {
    if text_md.trim().is_empty() {
        return Readability {
            chars_per_word: 0.0,
            words_per_paragraph: 0.0,
            heading_ratio: 0.0,
        };
    }

    let clean = MD_STRIP_RE.replace_all(text_md, "").replace('\n', " ");
    let words: Vec<&str> = clean.split_whitespace().collect();
    let word_count = words.len();
    let char_count: usize = words.iter().map(|w| w.chars().count()).sum();

    let paragraph_count = BLANK_SPLIT_RE
        .split(text_md)
        .filter(|p| !p.trim().is_empty())
        .count();
    let heading_count = HEADING_RE.find_iter(text_md).count();

    let chars_per_word = if word_count > 0 {
        char_count as f64 / word_count as f64
    } else {
        0.0
    };
    let words_per_paragraph = if paragraph_count > 0 {
        word_count as f64 / paragraph_count as f64
    } else {
        0.0
    };
    let heading_ratio = if paragraph_count > 0 {
        heading_count as f64 / paragraph_count as f64
    } else {
        0.0
    };

    Readability {
        chars_per_word: round2(chars_per_word),
        words_per_paragraph: round2(words_per_paragraph),
        heading_ratio: round3(heading_ratio),
    }
}

/// Media references per 1000 characters (markdown images unioned with
/// supplied attachments).
fn compute_media_density(text_md: &str, attachment_count: usize) -> f64 {
    if text_md.is_empty() {
        return 0.0;
    }
    let image_refs = IMAGE_REF_RE.find_iter(text_md).count();
    let media_count = image_refs + attachment_count;
    round2((media_count * 1000) as f64 / text_md.chars().count() as f64)
}

/// Links per 1000 characters: the larger of detected markdown links and the
/// supplied link list.
fn compute_link_density(text_md: &str, link_count: usize) -> f64 {
    if text_md.is_empty() {
        return 0.0;
    }
    let link_refs = LINK_REF_RE.find_iter(text_md).count();
    let links = link_refs.max(link_count);
    round2((links * 1000) as f64 / text_md.chars().count() as f64)
}

/// Quality flags per the fixed rule set. Thresholds: `<10` words short,
/// `>10000` long, headings required above 200 words.
fn determine_quality_flags(doc: &NormalizedDoc) -> Vec<String> {
    let text_md = &doc.text_md;
    let mut flags = Vec::new();

    if text_md.trim().is_empty() {
        flags.push("empty_body".to_string());
    }

    let word_count = text_md.split_whitespace().count();
    if word_count < 10 {
        flags.push("too_short".to_string());
    } else if word_count > 10000 {
        flags.push("too_long".to_string());
    }

    if !doc.attachments.is_empty() && word_count < 50 {
        let image_refs = IMAGE_REF_RE.find_iter(text_md).count();
        if image_refs >= doc.attachments.len() && word_count < 100 {
            flags.push("image_only".to_string());
        }
    }

    if !text_md.is_empty() && !HEADING_RE.is_match(text_md) && word_count > 200 {
        flags.push("no_structure".to_string());
    }

    if BROKEN_LINK_RE.is_match(text_md) {
        flags.push("broken_links".to_string());
    }

    flags
}

/// Quality score in [0,1]: monotone in the flag set, fixed penalty per flag.
pub fn quality_score(flags: &[String]) -> f64 {
    let mut penalty: f64 = 0.0;
    for flag in flags {
        penalty += match flag.as_str() {
            "empty_body" => 0.9,
            "too_short" => 0.4,
            "too_long" => 0.2,
            "image_only" => 0.3,
            "no_structure" => 0.2,
            "broken_links" => 0.1,
            _ => 0.0,
        };
    }
    round2((1.0 - penalty).clamp(0.0, 1.0))
}

fn mock_summary(text_md: &str) -> String {
    let first = text_md
        .split_terminator(['.', '!', '?'])
        .next()
        .unwrap_or("")
        .trim();
    if first.chars().count() > 300 {
        let truncated: String = first.chars().take(297).collect();
        format!("{}...", truncated)
    } else {
        first.to_string()
    }
}

fn mock_keywords(text_md: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for m in CAP_WORD_RE
        .find_iter(text_md)
        .chain(TECH_TERM_RE.find_iter(text_md))
    {
        let word = m.as_str().to_string();
        if !keywords.contains(&word) {
            keywords.push(word);
        }
    }
    keywords.truncate(8);
    keywords
}

fn mock_taxonomy(text_md: &str, source_system: &str) -> Vec<String> {
    let lower = text_md.to_lowercase();
    let mut labels = Vec::new();

    if ["api", "endpoint", "rest", "json"].iter().any(|t| lower.contains(t)) {
        labels.push("api-documentation".to_string());
    }
    if ["install", "setup", "configuration", "config"]
        .iter()
        .any(|t| lower.contains(t))
    {
        labels.push("setup-guide".to_string());
    }
    if ["tutorial", "how to", "step by step", "guide"]
        .iter()
        .any(|t| lower.contains(t))
    {
        labels.push("tutorial".to_string());
    }
    if ["release", "changelog", "version", "update"]
        .iter()
        .any(|t| lower.contains(t))
    {
        labels.push("release-notes".to_string());
    }
    if ["troubleshoot", "error", "issue", "problem"]
        .iter()
        .any(|t| lower.contains(t))
    {
        labels.push("troubleshooting".to_string());
    }
    if !source_system.is_empty() {
        labels.push(format!("source-{}", source_system));
    }
    labels.truncate(5);
    labels
}

/// Enrich a single normalized document.
pub fn enrich_document(doc: &NormalizedDoc, llm_enabled: bool) -> EnrichedDoc {
    let flags = determine_quality_flags(doc);
    let score = quality_score(&flags);

    let mut enriched = EnrichedDoc {
        id: doc.id.clone(),
        source_system: if doc.source_system.is_empty() {
            "unknown".to_string()
        } else {
            doc.source_system.clone()
        },
        collection: extract_collection(doc),
        path_tags: extract_path_tags(doc),
        readability: compute_readability(&doc.text_md),
        media_density: compute_media_density(&doc.text_md, doc.attachments.len()),
        link_density: compute_link_density(&doc.text_md, doc.links.len()),
        quality_flags: flags,
        quality_score: score,
        summary: None,
        keywords: None,
        taxonomy_labels: None,
    };

    if llm_enabled && !doc.text_md.trim().is_empty() {
        enriched.summary = Some(mock_summary(&doc.text_md));
        enriched.keywords = Some(mock_keywords(&doc.text_md));
        enriched.taxonomy_labels = Some(mock_taxonomy(&doc.text_md, &doc.source_system));
    }

    enriched
}

/// SHA-256 fingerprint over the canonical JSON of the enrichment-relevant
/// fields. Identical inputs produce identical fingerprints; changing any
/// covered field changes the digest.
pub fn enrichment_fingerprint(enriched: &EnrichedDoc) -> String {
    let mut fields = serde_json::json!({
        "enrichment_version": ENRICHMENT_VERSION,
        "collection": enriched.collection,
        "path_tags": enriched.path_tags,
        "readability": serde_json::to_value(&enriched.readability).unwrap_or_default(),
        "quality_flags": enriched.quality_flags,
    });
    let map = fields.as_object_mut().expect("fingerprint fields object");
    if let Some(ref summary) = enriched.summary {
        map.insert("summary".into(), summary.clone().into());
    }
    if let Some(ref keywords) = enriched.keywords {
        map.insert("keywords".into(), keywords.clone().into());
    }
    if let Some(ref labels) = enriched.taxonomy_labels {
        map.insert("taxonomy_labels".into(), labels.clone().into());
    }
    artifacts::sha256_hex(artifacts::canonical_json(&fields).as_bytes())
}

/// Suggest an edge between two documents: explicit title reference, else
/// topical keyword overlap.
fn suggest_edge(a: &NormalizedDoc, b: &NormalizedDoc) -> Option<SuggestedEdge> {
    if a.id == b.id {
        return None;
    }

    let text_a = a.text_md.to_lowercase();
    let title_b = b.title.to_lowercase();
    if !title_b.is_empty() && text_a.contains(&title_b) {
        return Some(SuggestedEdge {
            from_id: a.id.clone(),
            to_id: b.id.clone(),
            edge_type: "REFERENCES".to_string(),
            confidence: 0.8,
            evidence: format!("Document mentions '{}'", b.title),
        });
    }

    let words_a: std::collections::BTreeSet<String> = WORD4_RE
        .find_iter(&text_a)
        .map(|m| m.as_str().to_string())
        .collect();
    let text_b = b.text_md.to_lowercase();
    let words_b: std::collections::BTreeSet<String> = WORD4_RE
        .find_iter(&text_b)
        .map(|m| m.as_str().to_string())
        .collect();
    let overlap: Vec<&String> = words_a.intersection(&words_b).collect();

    if overlap.len() >= 3 {
        let confidence = round2((overlap.len() as f64 / 20.0).min(0.7));
        let sample: Vec<&str> = overlap.iter().take(5).map(|s| s.as_str()).collect();
        return Some(SuggestedEdge {
            from_id: a.id.clone(),
            to_id: b.id.clone(),
            edge_type: "RELATES_TO".to_string(),
            confidence,
            evidence: format!("Shared keywords: {}", sample.join(", ")),
        });
    }

    None
}

/// Options for [`enrich_run`].
#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    pub llm_enabled: bool,
    pub max_docs: Option<usize>,
    pub budget: Option<String>,
}

/// Statistics written to `enrich/assurance.json`.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichStats {
    pub run_id: String,
    pub docs_total: u64,
    pub docs_llm: u64,
    pub parse_errors: u64,
    pub suggested_edges_total: u64,
    pub quality_flags_counts: HashMap<String, u64>,
    pub below_threshold_count: u64,
    pub below_threshold_pct: f64,
    pub min_quality: f64,
    pub max_below_threshold_pct: f64,
    /// True when the below-threshold fraction exceeds the configured cap.
    /// Advisory only; downstream preflight records it but never blocks.
    pub quality_advisory_exceeded: bool,
    pub llm_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    pub duration_seconds: f64,
    pub completed_at: String,
}

/// Enrich every document of a run.
///
/// Reads `normalize/normalized.ndjson`; writes `enrich/enriched.jsonl`,
/// `enrich/fingerprints.jsonl`, `enrich/suggested_edges.jsonl` (when the
/// LLM overlay is enabled), and `enrich/assurance.{json,md}`.
pub fn enrich_run(
    config: &Config,
    run_id: &str,
    opts: &EnrichOptions,
    emitter: &mut EventEmitter,
) -> Result<EnrichStats> {
    let workroot = &config.workspace.workroot;
    let started = std::time::Instant::now();
    emitter.start("enrich.run");

    let input_path =
        artifacts::phase_dir(workroot, run_id, "normalize").join("normalized.ndjson");
    if !input_path.exists() {
        let reason = format!("Missing input artifact: {}", input_path.display());
        emitter.fail("enrich.run", &reason, started.elapsed().as_millis() as u64);
        bail!(reason);
    }

    let (mut docs, parse_errors): (Vec<NormalizedDoc>, usize) =
        artifacts::read_ndjson_lossy(&input_path)?;
    if let Some(max) = opts.max_docs {
        docs.truncate(max);
    }

    let enrich_dir = artifacts::phase_dir(workroot, run_id, "enrich");
    let mut enriched_writer = artifacts::NdjsonWriter::create(&enrich_dir.join("enriched.jsonl"))?;
    let mut fp_writer = artifacts::NdjsonWriter::create(&enrich_dir.join("fingerprints.jsonl"))?;

    let mut quality_flags_counts: HashMap<String, u64> = HashMap::new();
    let mut below_threshold = 0u64;
    let mut docs_llm = 0u64;

    for (idx, doc) in docs.iter().enumerate() {
        let enriched = enrich_document(doc, opts.llm_enabled);
        let fingerprint = enrichment_fingerprint(&enriched);

        for flag in &enriched.quality_flags {
            *quality_flags_counts.entry(flag.clone()).or_insert(0) += 1;
        }
        if enriched.quality_score < config.enrich.min_quality {
            below_threshold += 1;
        }
        if enriched.summary.is_some() {
            docs_llm += 1;
        }

        enriched_writer.write(&enriched)?;
        fp_writer.write(&FingerprintRecord {
            id: doc.id.clone(),
            enrichment_version: ENRICHMENT_VERSION.to_string(),
            fingerprint_sha256: fingerprint,
        })?;

        emitter.add_counts(1, 0, 0);
        if (idx + 1) % 100 == 0 {
            emitter.ok(
                "enrich.doc",
                EventFields {
                    doc_id: Some(doc.id.clone()),
                    ..Default::default()
                },
            );
        }
    }
    enriched_writer.finish()?;
    fp_writer.finish()?;

    // Suggested edges: heuristic pairwise pass, capped for cost.
    let mut suggested_edges_total = 0u64;
    if opts.llm_enabled {
        let pool: Vec<&NormalizedDoc> = docs.iter().take(1000).collect();
        let mut edge_writer =
            artifacts::NdjsonWriter::create(&enrich_dir.join("suggested_edges.jsonl"))?;
        for (i, a) in pool.iter().enumerate() {
            for b in pool.iter().skip(i + 1) {
                if let Some(edge) = suggest_edge(a, b) {
                    edge_writer.write(&edge)?;
                    suggested_edges_total += 1;
                }
            }
        }
        edge_writer.finish()?;
    }

    let docs_total = docs.len() as u64;
    let below_threshold_pct = if docs_total > 0 {
        below_threshold as f64 / docs_total as f64
    } else {
        0.0
    };

    let stats = EnrichStats {
        run_id: run_id.to_string(),
        docs_total,
        docs_llm,
        parse_errors: parse_errors as u64,
        suggested_edges_total,
        quality_flags_counts,
        below_threshold_count: below_threshold,
        below_threshold_pct: round3(below_threshold_pct),
        min_quality: config.enrich.min_quality,
        max_below_threshold_pct: config.enrich.max_below_threshold_pct,
        quality_advisory_exceeded: below_threshold_pct > config.enrich.max_below_threshold_pct,
        llm_enabled: opts.llm_enabled,
        budget: opts.budget.clone(),
        duration_seconds: round2(started.elapsed().as_secs_f64()),
        completed_at: artifacts::now_iso(),
    };

    artifacts::write_json_report(&enrich_dir.join("assurance.json"), &stats)
        .context("Failed to write enrich assurance")?;
    std::fs::write(enrich_dir.join("assurance.md"), assurance_markdown(&stats))
        .context("Failed to write enrich assurance markdown")?;

    if stats.quality_advisory_exceeded {
        emitter.emit(
            Level::Warning,
            "enrich.quality_advisory",
            Status::Ok,
            EventFields {
                reason: Some(format!(
                    "below_threshold_pct {} exceeds cap {}",
                    stats.below_threshold_pct, stats.max_below_threshold_pct
                )),
                ..Default::default()
            },
        );
    }
    emitter.end("enrich.run", started.elapsed().as_millis() as u64);
    Ok(stats)
}

fn assurance_markdown(stats: &EnrichStats) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Enrichment Assurance: {}", stats.run_id));
    lines.push(String::new());
    lines.push(format!("- **Docs:** {}", stats.docs_total));
    lines.push(format!("- **Docs with LLM overlay:** {}", stats.docs_llm));
    lines.push(format!("- **Parse errors:** {}", stats.parse_errors));
    lines.push(format!(
        "- **Suggested edges:** {}",
        stats.suggested_edges_total
    ));
    lines.push(format!(
        "- **Below quality threshold:** {} ({:.1}%)",
        stats.below_threshold_count,
        stats.below_threshold_pct * 100.0
    ));
    lines.push(format!(
        "- **Quality advisory exceeded:** {}",
        stats.quality_advisory_exceeded
    ));
    lines.push(String::new());
    lines.push("## Quality flags".to_string());
    lines.push(String::new());
    let mut flags: Vec<(&String, &u64)> = stats.quality_flags_counts.iter().collect();
    flags.sort();
    if flags.is_empty() {
        lines.push("*No flags raised*".to_string());
    }
    for (flag, count) in flags {
        lines.push(format!("- `{}`: {}", flag, count));
    }
    lines.push(String::new());
    lines.push(format!("Completed at {}", stats.completed_at));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, text: &str) -> NormalizedDoc {
        NormalizedDoc {
            id: id.to_string(),
            title: String::new(),
            space_key: None,
            url: String::new(),
            created_at: None,
            updated_at: None,
            body_repr: None,
            text_md: text.to_string(),
            links: Vec::new(),
            attachments: Vec::new(),
            source_system: "confluence".to_string(),
            labels: Vec::new(),
            content_sha256: None,
            breadcrumbs: None,
            collection: None,
            path_tags: None,
        }
    }

    fn wordy(n: usize) -> String {
        (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_collection_precedence() {
        let mut d = doc("a", "text");
        assert_eq!(extract_collection(&d), "confluence");
        d.space_key = Some("KB".to_string());
        assert_eq!(extract_collection(&d), "kb");
        d.collection = Some("docs".to_string());
        assert_eq!(extract_collection(&d), "docs");
    }

    #[test]
    fn test_path_tags_from_breadcrumbs_and_content() {
        let mut d = doc("a", "# API\n\nEndpoints.");
        d.breadcrumbs = Some(vec![
            "Developer Guide".to_string(),
            "Reference".to_string(),
            "The Page".to_string(),
        ]);
        let tags = extract_path_tags(&d);
        assert_eq!(tags, vec!["developer-guide", "reference", "api"]);
    }

    #[test]
    fn test_quality_flags_short_and_broken() {
        let d = doc("a", "Tiny [ref]() text.");
        let flags = determine_quality_flags(&d);
        assert!(flags.contains(&"too_short".to_string()));
        assert!(flags.contains(&"broken_links".to_string()));
    }

    #[test]
    fn test_no_structure_only_above_200_words() {
        let short = doc("a", &wordy(100));
        assert!(!determine_quality_flags(&short).contains(&"no_structure".to_string()));
        let long = doc("b", &wordy(250));
        assert!(determine_quality_flags(&long).contains(&"no_structure".to_string()));
        let with_heading = doc("c", &format!("# Heading\n\n{}", wordy(250)));
        assert!(!determine_quality_flags(&with_heading).contains(&"no_structure".to_string()));
    }

    #[test]
    fn test_quality_score_monotone() {
        let none = quality_score(&[]);
        let one = quality_score(&["broken_links".to_string()]);
        let two = quality_score(&["broken_links".to_string(), "too_short".to_string()]);
        assert_eq!(none, 1.0);
        assert!(one < none);
        assert!(two < one);
        assert!(two >= 0.0);
    }

    #[test]
    fn test_fingerprint_stable_across_runs() {
        let d = doc("a", &format!("# Title\n\n{}", wordy(200)));
        let fp1 = enrichment_fingerprint(&enrich_document(&d, false));
        let fp2 = enrichment_fingerprint(&enrich_document(&d, false));
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_fingerprint_invariant_to_uncovered_fields() {
        // Same readability/flags/tags but different body wording that does
        // not change any covered field -> same fingerprint.
        let mut a = enrich_document(&doc("a", &wordy(50)), false);
        let b = a.clone();
        a.media_density = 9.99; // not part of the fingerprint
        assert_eq!(enrichment_fingerprint(&a), enrichment_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_sensitive_to_path_tags() {
        let base = enrich_document(&doc("a", &wordy(50)), false);
        let mut changed = base.clone();
        changed.path_tags = vec!["api".to_string(), "installation".to_string()];
        assert_ne!(
            enrichment_fingerprint(&base),
            enrichment_fingerprint(&changed)
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_llm_overlay() {
        let d = doc("a", "Install the API service. Then configure it.");
        let plain = enrich_document(&d, false);
        let overlay = enrich_document(&d, true);
        assert_ne!(
            enrichment_fingerprint(&plain),
            enrichment_fingerprint(&overlay)
        );
    }

    #[test]
    fn test_readability_zero_guarded() {
        let r = compute_readability("");
        assert_eq!(r.chars_per_word, 0.0);
        assert_eq!(r.words_per_paragraph, 0.0);
        assert_eq!(r.heading_ratio, 0.0);
    }

    #[test]
    fn test_edge_reference_detection() {
        let mut a = doc("a", "See the Widget Guide for details and more context here.");
        a.title = "Alpha".to_string();
        let mut b = doc("b", "Unrelated content body.");
        b.title = "Widget Guide".to_string();
        let edge = suggest_edge(&a, &b).unwrap();
        assert_eq!(edge.edge_type, "REFERENCES");
        assert_eq!(edge.from_id, "a");
        assert_eq!(edge.to_id, "b");
    }

    #[test]
    fn test_edge_keyword_overlap() {
        let a = doc("a", "deployment pipeline configuration rollout strategy");
        let b = doc("b", "deployment pipeline configuration checklist staging");
        let edge = suggest_edge(&a, &b).unwrap();
        assert_eq!(edge.edge_type, "RELATES_TO");
        assert!(edge.confidence > 0.0 && edge.confidence <= 0.7);
    }
}
