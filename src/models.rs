//! Core data models used throughout Trailblazer.
//!
//! These types are the artifact line shapes that flow between pipeline
//! phases: normalized documents, enriched documents, fingerprints, and
//! chunks. Every struct round-trips through serde as one NDJSON line.

use serde::{Deserialize, Serialize};

/// One line of `normalize/normalized.ndjson`, as produced by the source
/// adapters (Confluence or DITA) after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedDoc {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_key: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Body representation the markdown was converted from: storage | adf | dita.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_repr: Option<String>,
    #[serde(default)]
    pub text_md: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub source_system: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    /// Ordered root→parent ancestor titles, used for breadcrumb tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breadcrumbs: Option<Vec<String>>,
    /// Pre-assigned collection (DITA sets this; Confluence does not).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_tags: Option<Vec<String>>,
}

/// Readability metrics computed on markdown-stripped text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readability {
    pub chars_per_word: f64,
    pub words_per_paragraph: f64,
    pub heading_ratio: f64,
}

/// One line of `enrich/enriched.jsonl`: the rule-based fields plus the
/// optional LLM overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedDoc {
    pub id: String,
    pub source_system: String,
    pub collection: String,
    pub path_tags: Vec<String>,
    pub readability: Readability,
    pub media_density: f64,
    pub link_density: f64,
    pub quality_flags: Vec<String>,
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy_labels: Option<Vec<String>>,
}

/// One line of `enrich/fingerprints.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: String,
    pub enrichment_version: String,
    pub fingerprint_sha256: String,
}

/// A pairwise edge suggestion between two documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedEdge {
    #[serde(rename = "from")]
    pub from_id: String,
    #[serde(rename = "to")]
    pub to_id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub confidence: f64,
    pub evidence: String,
}

/// Source metadata carried on each chunk so retrieval hits can be rendered
/// without a join back to the artifact store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Traceability {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub source_system: String,
}

/// One line of `chunk/chunks.ndjson`.
///
/// `chunk_id` is `{doc_id}:{ord:04}`; `ord` values form a contiguous
/// 0-based sequence within a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub ord: i64,
    pub text_md: String,
    pub char_count: i64,
    pub token_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub traceability: Traceability,
}
