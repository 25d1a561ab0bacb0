//! Embed manifest: a record of exactly what was embedded for a run, and the
//! diff machinery that decides whether a re-embed would change anything.
//!
//! The manifest pins provider/model/dimension, tokenizer identity, enricher
//! and chunker versions, the chunk config, every document fingerprint, and
//! a hash over the full chunk set. `compare_manifests` reduces two
//! manifests to a set of change reasons; `CONTENT_CHANGE` fires on any
//! `chunkSetHash` difference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::artifacts;
use crate::chunk::{CHUNKER_VERSION, TOKENIZER_NAME, TOKENIZER_VERSION};
use crate::config::Config;
use crate::enrich::ENRICHMENT_VERSION;
use crate::models::{ChunkRecord, FingerprintRecord};

pub const PROVIDER_CHANGE: &str = "PROVIDER_CHANGE";
pub const MODEL_CHANGE: &str = "MODEL_CHANGE";
pub const DIMENSION_CHANGE: &str = "DIMENSION_CHANGE";
pub const TOKENIZER_CHANGE: &str = "TOKENIZER_CHANGE";
pub const CHUNKER_CHANGE: &str = "CHUNKER_CHANGE";
pub const CHUNK_CONFIG_CHANGE: &str = "CHUNK_CONFIG_CHANGE";
pub const CONTENT_CHANGE: &str = "CONTENT_CHANGE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerInfo {
    pub name: String,
    pub version: String,
}

impl Default for TokenizerInfo {
    fn default() -> Self {
        Self {
            name: TOKENIZER_NAME.to_string(),
            version: TOKENIZER_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkConfigInfo {
    pub max_tokens: usize,
    pub min_tokens: usize,
    pub prefer_headings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedManifest {
    pub run_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub tokenizer: TokenizerInfo,
    pub enricher_version: String,
    pub chunker_version: String,
    pub chunk_config: ChunkConfigInfo,
    pub doc_fingerprints: Vec<String>,
    pub chunk_set_hash: String,
    pub chunks_embedded: u64,
    pub total_chunks: u64,
}

/// SHA-256 over the canonical JSON list of `[chunk_id, token_count,
/// content_hash]` tuples sorted by chunk id.
pub fn chunk_set_hash(chunks: &[ChunkRecord]) -> String {
    let mut tuples: Vec<(String, i64, String)> = chunks
        .iter()
        .map(|c| {
            (
                c.chunk_id.clone(),
                c.token_count,
                c.content_hash.clone().unwrap_or_default(),
            )
        })
        .collect();
    tuples.sort_by(|a, b| a.0.cmp(&b.0));

    let value = serde_json::json!(tuples
        .iter()
        .map(|(id, tokens, hash)| serde_json::json!([id, tokens, hash]))
        .collect::<Vec<_>>());
    artifacts::sha256_hex(artifacts::canonical_json(&value).as_bytes())
}

fn git_commit() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if commit.is_empty() {
        None
    } else {
        Some(commit)
    }
}

/// Build the manifest for the current state of a run's artifacts.
pub fn build_manifest(
    config: &Config,
    run_id: &str,
    provider: &str,
    model: &str,
    dimension: usize,
    chunks_embedded: u64,
) -> Result<EmbedManifest> {
    let workroot = &config.workspace.workroot;

    let fingerprints_path =
        artifacts::phase_dir(workroot, run_id, "enrich").join("fingerprints.jsonl");
    let doc_fingerprints: Vec<String> = if fingerprints_path.exists() {
        let (records, _): (Vec<FingerprintRecord>, usize) =
            artifacts::read_ndjson_lossy(&fingerprints_path)?;
        records.into_iter().map(|r| r.fingerprint_sha256).collect()
    } else {
        Vec::new()
    };

    let chunks_path = artifacts::phase_dir(workroot, run_id, "chunk").join("chunks.ndjson");
    let chunks: Vec<ChunkRecord> = if chunks_path.exists() {
        let (records, _) = artifacts::read_ndjson_lossy(&chunks_path)?;
        records
    } else {
        Vec::new()
    };

    Ok(EmbedManifest {
        run_id: run_id.to_string(),
        timestamp: artifacts::now_iso(),
        git_commit: git_commit(),
        provider: provider.to_string(),
        model: model.to_string(),
        dimension,
        tokenizer: TokenizerInfo::default(),
        enricher_version: ENRICHMENT_VERSION.to_string(),
        chunker_version: CHUNKER_VERSION.to_string(),
        chunk_config: ChunkConfigInfo {
            max_tokens: config.chunking.max_tokens,
            min_tokens: config.chunking.min_tokens,
            prefer_headings: config.chunking.prefer_headings,
        },
        chunk_set_hash: chunk_set_hash(&chunks),
        total_chunks: chunks.len() as u64,
        doc_fingerprints,
        chunks_embedded,
    })
}

pub fn manifest_path(config: &Config, run_id: &str) -> PathBuf {
    artifacts::phase_dir(&config.workspace.workroot, run_id, "embed").join("manifest.json")
}

pub fn write_manifest(config: &Config, manifest: &EmbedManifest) -> Result<PathBuf> {
    let path = manifest_path(config, &manifest.run_id);
    artifacts::write_json_report(&path, manifest)?;
    Ok(path)
}

pub fn load_manifest(path: &Path) -> Result<EmbedManifest> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("Malformed manifest: {}", path.display()))
}

/// Compare the current state against a previous manifest.
///
/// Returns whether anything changed plus the exact reasons, in a fixed
/// order. `compare_manifests(m, m)` is always `(false, [])`.
pub fn compare_manifests(
    current: &EmbedManifest,
    previous: &EmbedManifest,
) -> (bool, Vec<&'static str>) {
    let mut reasons = Vec::new();

    if current.provider != previous.provider {
        reasons.push(PROVIDER_CHANGE);
    }
    if current.model != previous.model {
        reasons.push(MODEL_CHANGE);
    }
    if current.dimension != previous.dimension {
        reasons.push(DIMENSION_CHANGE);
    }
    if current.tokenizer != previous.tokenizer {
        reasons.push(TOKENIZER_CHANGE);
    }
    if current.chunker_version != previous.chunker_version {
        reasons.push(CHUNKER_CHANGE);
    }
    if current.chunk_config != previous.chunk_config {
        reasons.push(CHUNK_CONFIG_CHANGE);
    }
    if current.chunk_set_hash != previous.chunk_set_hash {
        reasons.push(CONTENT_CHANGE);
    }

    (!reasons.is_empty(), reasons)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub run_id: String,
    pub timestamp: String,
    pub changed: bool,
    pub reasons: Vec<String>,
    pub current: DiffSide,
    pub previous: DiffSide,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSide {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub tokenizer: TokenizerInfo,
    pub chunker_version: String,
    pub chunk_config: ChunkConfigInfo,
    pub chunk_set_hash: String,
    pub total_chunks: u64,
    pub timestamp: String,
}

fn diff_side(manifest: &EmbedManifest) -> DiffSide {
    DiffSide {
        provider: manifest.provider.clone(),
        model: manifest.model.clone(),
        dimension: manifest.dimension,
        tokenizer: manifest.tokenizer.clone(),
        chunker_version: manifest.chunker_version.clone(),
        chunk_config: manifest.chunk_config.clone(),
        chunk_set_hash: manifest.chunk_set_hash.clone(),
        total_chunks: manifest.total_chunks,
        timestamp: manifest.timestamp.clone(),
    }
}

pub fn diff_report(
    current: &EmbedManifest,
    previous: &EmbedManifest,
    changed: bool,
    reasons: &[&str],
) -> DiffReport {
    DiffReport {
        run_id: current.run_id.clone(),
        timestamp: artifacts::now_iso(),
        changed,
        reasons: reasons.iter().map(|r| r.to_string()).collect(),
        current: diff_side(current),
        previous: diff_side(previous),
    }
}

pub fn format_diff_markdown(report: &DiffReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Embed Diff Report: {}", report.run_id));
    lines.push(String::new());
    lines.push(format!("**Timestamp:** {}", report.timestamp));
    lines.push(format!("**Changed:** {}", report.changed));
    if !report.reasons.is_empty() {
        lines.push(format!("**Reasons:** {}", report.reasons.join(", ")));
    }
    for (name, side) in [("Current", &report.current), ("Previous", &report.previous)] {
        lines.push(String::new());
        lines.push(format!("## {} State", name));
        lines.push(format!("- **Provider:** {}", side.provider));
        lines.push(format!("- **Model:** {}", side.model));
        lines.push(format!("- **Dimension:** {}", side.dimension));
        lines.push(format!(
            "- **Tokenizer:** {} v{}",
            side.tokenizer.name, side.tokenizer.version
        ));
        lines.push(format!("- **Chunker Version:** {}", side.chunker_version));
        lines.push(format!(
            "- **Chunk Set Hash:** {}...",
            &side.chunk_set_hash[..side.chunk_set_hash.len().min(12)]
        ));
        lines.push(format!("- **Total Chunks:** {}", side.total_chunks));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Traceability;

    fn manifest() -> EmbedManifest {
        EmbedManifest {
            run_id: "2025-01-01_000000_abcd".to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            git_commit: None,
            provider: "dummy".to_string(),
            model: "dummy-384".to_string(),
            dimension: 1536,
            tokenizer: TokenizerInfo::default(),
            enricher_version: "v1".to_string(),
            chunker_version: "v1".to_string(),
            chunk_config: ChunkConfigInfo {
                max_tokens: 800,
                min_tokens: 120,
                prefer_headings: true,
            },
            doc_fingerprints: vec!["f1".to_string()],
            chunk_set_hash: "H".to_string(),
            chunks_embedded: 10,
            total_chunks: 10,
        }
    }

    fn chunk(id: &str, tokens: i64) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            doc_id: id.split(':').next().unwrap().to_string(),
            ord: 0,
            text_md: "text".to_string(),
            char_count: 4,
            token_count: tokens,
            content_hash: Some(format!("hash-{}", id)),
            traceability: Traceability::default(),
        }
    }

    #[test]
    fn test_identity_compare_is_unchanged() {
        let m = manifest();
        let (changed, reasons) = compare_manifests(&m, &m);
        assert!(!changed);
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_content_change_only() {
        let prev = manifest();
        let mut cur = manifest();
        cur.chunk_set_hash = "H2".to_string();
        let (changed, reasons) = compare_manifests(&cur, &prev);
        assert!(changed);
        assert_eq!(reasons, vec![CONTENT_CHANGE]);
    }

    #[test]
    fn test_dimension_and_content_change() {
        let prev = manifest();
        let mut cur = manifest();
        cur.chunk_set_hash = "H2".to_string();
        cur.dimension = 1024;
        let (_, reasons) = compare_manifests(&cur, &prev);
        assert_eq!(reasons, vec![DIMENSION_CHANGE, CONTENT_CHANGE]);
    }

    #[test]
    fn test_each_field_surfaces_its_reason() {
        let prev = manifest();

        let mut cur = manifest();
        cur.provider = "remote".to_string();
        assert_eq!(compare_manifests(&cur, &prev).1, vec![PROVIDER_CHANGE]);

        let mut cur = manifest();
        cur.model = "other".to_string();
        assert_eq!(compare_manifests(&cur, &prev).1, vec![MODEL_CHANGE]);

        let mut cur = manifest();
        cur.tokenizer.version = "2".to_string();
        assert_eq!(compare_manifests(&cur, &prev).1, vec![TOKENIZER_CHANGE]);

        let mut cur = manifest();
        cur.chunker_version = "v2".to_string();
        assert_eq!(compare_manifests(&cur, &prev).1, vec![CHUNKER_CHANGE]);

        let mut cur = manifest();
        cur.chunk_config.max_tokens = 400;
        assert_eq!(compare_manifests(&cur, &prev).1, vec![CHUNK_CONFIG_CHANGE]);
    }

    #[test]
    fn test_chunk_set_hash_is_order_independent() {
        let a = vec![chunk("d:0000", 10), chunk("d:0001", 20)];
        let b = vec![chunk("d:0001", 20), chunk("d:0000", 10)];
        assert_eq!(chunk_set_hash(&a), chunk_set_hash(&b));
    }

    #[test]
    fn test_chunk_set_hash_sensitive_to_tokens() {
        let a = vec![chunk("d:0000", 10)];
        let mut b = vec![chunk("d:0000", 10)];
        b[0].token_count = 11;
        assert_ne!(chunk_set_hash(&a), chunk_set_hash(&b));
    }

    #[test]
    fn test_manifest_roundtrip_camel_case() {
        let m = manifest();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"chunkSetHash\""));
        assert!(json.contains("\"runId\""));
        assert!(json.contains("\"maxTokens\""));
        let back: EmbedManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunk_set_hash, m.chunk_set_hash);
        assert_eq!(back.chunk_config, m.chunk_config);
    }
}
