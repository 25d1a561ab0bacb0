//! Configuration parsing and validation.
//!
//! Trailblazer is configured via a TOML file (default: `config/tb.toml`).
//! The config defines the database URL, workspace root for run artifacts,
//! chunking parameters, embedding provider settings, retrieval tuning,
//! enrichment quality thresholds, and worker coordination knobs.
//!
//! The loaded [`Config`] is an immutable value passed into each phase; no
//! phase mutates it.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection URL, e.g. `postgres://tb:tb@localhost:5432/trailblazer`.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_statement_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root directory holding `runs/<run_id>/...` and `logs/<run_id>/...`.
    #[serde(default = "default_workroot")]
    pub workroot: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            workroot: default_workroot(),
        }
    }
}

fn default_workroot() -> PathBuf {
    PathBuf::from("var")
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_true")]
    pub prefer_headings: bool,
    #[serde(default = "default_overlap_pct")]
    pub overlap_pct: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            min_tokens: default_min_tokens(),
            prefer_headings: true,
            overlap_pct: default_overlap_pct(),
        }
    }
}

fn default_max_tokens() -> usize {
    800
}
fn default_min_tokens() -> usize {
    120
}
fn default_overlap_pct() -> f64 {
    0.15
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Provider name: `dummy` or `remote`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the remote provider (any OpenAI-compatible endpoint).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: Some(384),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "dummy".to_string()
}
fn default_batch_size() -> usize {
    128
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_topk")]
    pub topk_dense: i64,
    #[serde(default = "default_topk")]
    pub topk_bm25: i64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: i64,
    #[serde(default = "default_true")]
    pub enable_boosts: bool,
    #[serde(default = "default_true")]
    pub enable_expansion: bool,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Use a client-side linear scan instead of the pgvector operator.
    /// Acceptable only for test configurations without the extension.
    #[serde(default)]
    pub linear_scan: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            topk_dense: default_topk(),
            topk_bm25: default_topk(),
            rrf_k: default_rrf_k(),
            enable_boosts: true,
            enable_expansion: true,
            final_limit: default_final_limit(),
            max_chars: default_max_chars(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            linear_scan: false,
        }
    }
}

fn default_topk() -> i64 {
    200
}
fn default_rrf_k() -> i64 {
    60
}
fn default_final_limit() -> usize {
    8
}
fn default_max_chars() -> usize {
    6000
}
fn default_max_chunks_per_doc() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    #[serde(default = "default_max_below_threshold_pct")]
    pub max_below_threshold_pct: f64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            max_below_threshold_pct: default_max_below_threshold_pct(),
        }
    }
}

fn default_min_quality() -> f64 {
    0.60
}
fn default_max_below_threshold_pct() -> f64 {
    0.20
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreflightConfig {
    #[serde(default = "default_min_embed_docs")]
    pub min_embed_docs: usize,
    /// Optional $/1k-token price for plan cost estimates.
    #[serde(default)]
    pub price_per_1k: Option<f64>,
    /// Optional tokens-per-second per worker for plan time estimates.
    #[serde(default)]
    pub tps_per_worker: Option<f64>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_embed_docs: default_min_embed_docs(),
            price_per_1k: None,
            tps_per_worker: None,
        }
    }
}

fn default_min_embed_docs() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default = "default_claim_ttl_minutes")]
    pub claim_ttl_minutes: i64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            claim_ttl_minutes: default_claim_ttl_minutes(),
            workers: default_workers(),
        }
    }
}

fn default_claim_ttl_minutes() -> i64 {
    60
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Rotate `events.ndjson` when it exceeds this many megabytes.
    #[serde(default = "default_rotation_mb")]
    pub rotation_mb: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            rotation_mb: default_rotation_mb(),
        }
    }
}

fn default_rotation_mb() -> u64 {
    64
}

impl EmbeddingConfig {
    /// Resolved embedding dimension for the configured provider.
    pub fn dimension(&self) -> usize {
        self.dims.unwrap_or(384)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.min_tokens > config.chunking.max_tokens {
        anyhow::bail!("chunking.min_tokens must be <= chunking.max_tokens");
    }
    if !(0.0..1.0).contains(&config.chunking.overlap_pct) {
        anyhow::bail!("chunking.overlap_pct must be in [0.0, 1.0)");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "dummy" | "remote" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be dummy or remote.",
            other
        ),
    }
    let dims = config.embedding.dimension();
    if dims == 0 || dims > 8192 {
        anyhow::bail!("embedding.dims must be in 1..=8192, got {}", dims);
    }
    if config.embedding.provider == "remote" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'remote'");
    }

    // Validate enrichment thresholds
    if !(0.0..=1.0).contains(&config.enrich.min_quality) {
        anyhow::bail!("enrich.min_quality must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.enrich.max_below_threshold_pct) {
        anyhow::bail!("enrich.max_below_threshold_pct must be in [0.0, 1.0]");
    }

    // Validate coordination
    if config.coordination.claim_ttl_minutes < 1 {
        anyhow::bail!("coordination.claim_ttl_minutes must be >= 1");
    }
    if config.coordination.workers == 0 {
        anyhow::bail!("coordination.workers must be >= 1");
    }

    if config.retrieval.rrf_k < 1 {
        anyhow::bail!("retrieval.rrf_k must be >= 1");
    }

    Ok(config)
}
