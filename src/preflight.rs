//! Preflight validation: certify a run is ready to embed or explain why it
//! is blocked, and aggregate verdicts over a plan of many runs.
//!
//! Blocking reasons are structural only — missing artifacts, incoherent
//! provider/model/dimension config, or zero embeddable documents. The
//! quality gate is advisory: it is reported, never a blocker.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::artifacts;
use crate::config::Config;
use crate::manifest;
use crate::models::{ChunkRecord, EnrichedDoc};

/// Options for a preflight check; provider identity must match what the
/// embed loader will use.
#[derive(Debug, Clone)]
pub struct PreflightOptions {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub min_embed_docs: usize,
    pub min_quality: f64,
    pub max_below_threshold_pct: f64,
}

impl PreflightOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.embedding.provider.clone(),
            model: config
                .embedding
                .model
                .clone()
                .unwrap_or_else(|| format!("dummy-{}", config.embedding.dimension())),
            dimension: config.embedding.dimension(),
            min_embed_docs: config.preflight.min_embed_docs,
            min_quality: config.enrich.min_quality,
            max_below_threshold_pct: config.enrich.max_below_threshold_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocTotals {
    pub all: usize,
    pub embeddable: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityStats {
    pub p50: f64,
    pub p90: f64,
    pub below_threshold_pct: f64,
    pub min_quality: f64,
    pub max_below_threshold_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    pub total: i64,
    pub min: i64,
    pub max: i64,
    pub avg: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactChecks {
    pub enriched: bool,
    pub chunks: bool,
    pub tokenizer: bool,
    pub config: bool,
}

/// Quality gating mode and outcome. `quality` is always true: the gate is
/// advisory and never blocks a run.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryInfo {
    pub quality: bool,
    pub quality_exceeded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaInfo {
    pub changed: bool,
    pub reasons: Vec<String>,
}

/// Result of a per-run preflight check, written to `preflight/preflight.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preflight {
    pub status: String,
    pub reasons: Vec<String>,
    pub doc_totals: DocTotals,
    pub token_stats: TokenStats,
    pub quality: QualityStats,
    pub quality_distribution: HashMap<String, usize>,
    pub advisory: AdvisoryInfo,
    pub artifacts: ArtifactChecks,
    /// Non-blocking comparison against the prior manifest, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaInfo>,
    pub timestamp: String,
    pub run_id: String,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

impl Preflight {
    pub fn is_ready(&self) -> bool {
        self.status == "READY"
    }
}

/// Validate provider/model/dimension coherence.
fn config_issues(opts: &PreflightOptions) -> Vec<String> {
    let mut issues = Vec::new();
    match opts.provider.as_str() {
        "dummy" | "remote" => {}
        other => issues.push(format!("invalid_provider: {}", other)),
    }
    if opts.provider == "remote" && opts.model.is_empty() {
        issues.push("invalid_model_for_provider: remote requires a model".to_string());
    }
    if opts.dimension == 0 || opts.dimension > 8192 {
        issues.push(format!("invalid_dimension: {}", opts.dimension));
    }
    issues
}

/// The baseline tokenizer is a pure function with no external assets, so it
/// is always loadable; a swapped-in tokenizer implementation would verify
/// its model files here.
fn tokenizer_loadable() -> bool {
    crate::chunk::token_count("probe text") == 2
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p).ceil() as usize).clamp(1, sorted.len()) - 1;
    sorted[idx]
}

/// Run preflight validation for a single run.
pub fn preflight_run(config: &Config, run_id: &str, opts: &PreflightOptions) -> Result<Preflight> {
    let workroot = &config.workspace.workroot;
    let enriched_path = artifacts::phase_dir(workroot, run_id, "enrich").join("enriched.jsonl");
    let chunks_path = artifacts::phase_dir(workroot, run_id, "chunk").join("chunks.ndjson");

    let mut reasons: Vec<String> = Vec::new();

    let enriched_ok = artifacts::non_empty(&enriched_path);
    if !enriched_ok {
        reasons.push("MISSING_ENRICHED_JSONL".to_string());
    }
    let chunks_ok = artifacts::non_empty(&chunks_path);
    if !chunks_ok {
        reasons.push("MISSING_CHUNKS_NDJSON".to_string());
    }

    let tokenizer_ok = tokenizer_loadable();
    if !tokenizer_ok {
        reasons.push("tokenizer_unavailable".to_string());
    }

    let issues = config_issues(opts);
    let config_ok = issues.is_empty();
    reasons.extend(issues);

    // Embeddable docs and the skiplist.
    let mut skipped_ids: Vec<String> = Vec::new();
    let mut scores: Vec<f64> = Vec::new();
    let mut quality_distribution: HashMap<String, usize> = HashMap::new();
    let mut total_docs = 0usize;

    if enriched_ok {
        let (docs, _): (Vec<EnrichedDoc>, usize) = artifacts::read_ndjson_lossy(&enriched_path)?;
        total_docs = docs.len();
        for doc in &docs {
            scores.push(doc.quality_score);
            if doc.quality_score < opts.min_quality {
                skipped_ids.push(doc.id.clone());
            }
            for flag in &doc.quality_flags {
                *quality_distribution.entry(flag.clone()).or_insert(0) += 1;
            }
        }
    }
    let embeddable = total_docs - skipped_ids.len();
    if embeddable < opts.min_embed_docs {
        reasons.push("EMBEDDABLE_DOCS=0".to_string());
    }

    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let quality = QualityStats {
        p50: percentile(&scores, 0.5),
        p90: if scores.len() >= 10 {
            percentile(&scores, 0.9)
        } else {
            scores.last().copied().unwrap_or(0.0)
        },
        below_threshold_pct: if total_docs > 0 {
            skipped_ids.len() as f64 / total_docs as f64
        } else {
            0.0
        },
        min_quality: opts.min_quality,
        max_below_threshold_pct: opts.max_below_threshold_pct,
    };

    // Token stats over the chunk set.
    let mut token_stats = TokenStats::default();
    if chunks_ok {
        let (chunks, _): (Vec<ChunkRecord>, usize) = artifacts::read_ndjson_lossy(&chunks_path)?;
        if !chunks.is_empty() {
            token_stats.min = chunks.iter().map(|c| c.token_count).min().unwrap_or(0);
            token_stats.max = chunks.iter().map(|c| c.token_count).max().unwrap_or(0);
            token_stats.total = chunks.iter().map(|c| c.token_count).sum();
            token_stats.avg = token_stats.total as f64 / chunks.len() as f64;
        }
    }

    // Delta vs prior manifest: informational only.
    let prior_path = manifest::manifest_path(config, run_id);
    let delta = if prior_path.exists() {
        let previous = manifest::load_manifest(&prior_path)?;
        let current = manifest::build_manifest(
            config,
            run_id,
            &opts.provider,
            &opts.model,
            opts.dimension,
            0,
        )?;
        let (changed, diff_reasons) = manifest::compare_manifests(&current, &previous);
        Some(DeltaInfo {
            changed,
            reasons: diff_reasons.iter().map(|r| r.to_string()).collect(),
        })
    } else {
        None
    };

    let status = if reasons.is_empty() { "READY" } else { "BLOCKED" };

    let result = Preflight {
        status: status.to_string(),
        reasons,
        doc_totals: DocTotals {
            all: total_docs,
            embeddable,
            skipped: skipped_ids.len(),
        },
        token_stats,
        quality_distribution,
        advisory: AdvisoryInfo {
            quality: true,
            quality_exceeded: quality.below_threshold_pct > opts.max_below_threshold_pct,
        },
        quality,
        artifacts: ArtifactChecks {
            enriched: enriched_ok,
            chunks: chunks_ok,
            tokenizer: tokenizer_ok,
            config: config_ok,
        },
        delta,
        timestamp: artifacts::now_iso(),
        run_id: run_id.to_string(),
        provider: opts.provider.clone(),
        model: opts.model.clone(),
        dimension: opts.dimension,
    };

    let preflight_dir = artifacts::phase_dir(workroot, run_id, "preflight");
    artifacts::write_json_report(&preflight_dir.join("preflight.json"), &result)?;

    if !skipped_ids.is_empty() {
        let skiplist = serde_json::json!({
            "skip": skipped_ids,
            "reason": "quality_below_min",
            "min_quality": opts.min_quality,
            "total_docs": total_docs,
            "skipped_count": result.doc_totals.skipped,
        });
        artifacts::write_json_report(&preflight_dir.join("doc_skiplist.json"), &skiplist)?;
    }

    Ok(result)
}

/// Load the skiplist written by a prior preflight, if any.
pub fn load_skiplist(config: &Config, run_id: &str) -> Vec<String> {
    let path = artifacts::phase_dir(&config.workspace.workroot, run_id, "preflight")
        .join("doc_skiplist.json");
    let Ok(body) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("skip").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
pub struct PlanRunDetail {
    pub rid: String,
    pub status: String,
    pub reason: String,
    pub docs_total: usize,
    pub docs_embeddable: usize,
    pub docs_skipped: usize,
    pub tokens: i64,
    pub quality_p50: f64,
}

#[derive(Debug, Serialize)]
pub struct PlanPreflight {
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub total_runs_planned: usize,
    pub ready_runs: usize,
    pub blocked_runs: usize,
    pub total_embeddable_docs: usize,
    pub total_skipped_docs: usize,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<f64>,
    pub runs_detail: Vec<PlanRunDetail>,
}

/// Parse one plan file line: `run_id[:chunk_count]` or a `runs/<rid>` path.
fn parse_plan_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some((rid, _count)) = line.split_once(':') {
        return Some(rid.trim().to_string());
    }
    if line.contains("runs/") {
        return Path::new(line)
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
    }
    Some(line.to_string())
}

/// Run preflight over every run in a plan file and write the aggregate
/// report set (`plan_preflight.{json,csv,md}`, `ready.txt`, `blocked.txt`).
///
/// Returns success even when some runs are blocked; errors are reserved for
/// a missing plan file or an empty plan.
pub fn preflight_plan(
    config: &Config,
    plan_file: &Path,
    opts: &PreflightOptions,
) -> Result<PlanPreflight> {
    let body = std::fs::read_to_string(plan_file)
        .with_context(|| format!("Plan file not found: {}", plan_file.display()))?;

    let run_ids: Vec<String> = body.lines().filter_map(parse_plan_line).collect();
    if run_ids.is_empty() {
        bail!("No valid runs found in plan file: {}", plan_file.display());
    }

    let mut details = Vec::new();
    let mut ready = Vec::new();
    let mut blocked = Vec::new();
    let mut total_embeddable = 0usize;
    let mut total_skipped = 0usize;
    let mut total_tokens = 0i64;

    for run_id in &run_ids {
        let result = preflight_run(config, run_id, opts)?;
        total_embeddable += result.doc_totals.embeddable;
        total_skipped += result.doc_totals.skipped;
        total_tokens += result.token_stats.total;

        if result.is_ready() {
            ready.push(run_id.clone());
        } else {
            blocked.push(run_id.clone());
        }

        details.push(PlanRunDetail {
            rid: run_id.clone(),
            status: result.status.clone(),
            reason: result.reasons.join(", "),
            docs_total: result.doc_totals.all,
            docs_embeddable: result.doc_totals.embeddable,
            docs_skipped: result.doc_totals.skipped,
            tokens: result.token_stats.total,
            quality_p50: result.quality.p50,
        });
    }

    let estimated_cost_usd = config
        .preflight
        .price_per_1k
        .map(|price| total_tokens as f64 / 1000.0 * price);
    let estimated_seconds = config.preflight.tps_per_worker.map(|tps| {
        let throughput = tps * config.coordination.workers as f64;
        if throughput > 0.0 {
            total_tokens as f64 / throughput
        } else {
            0.0
        }
    });

    let plan = PlanPreflight {
        timestamp: artifacts::now_iso(),
        provider: opts.provider.clone(),
        model: opts.model.clone(),
        dimension: opts.dimension,
        total_runs_planned: run_ids.len(),
        ready_runs: ready.len(),
        blocked_runs: blocked.len(),
        total_embeddable_docs: total_embeddable,
        total_skipped_docs: total_skipped,
        total_tokens,
        estimated_cost_usd,
        estimated_seconds,
        runs_detail: details,
    };

    write_plan_outputs(config, &plan, &ready)?;
    Ok(plan)
}

fn write_plan_outputs(config: &Config, plan: &PlanPreflight, ready: &[String]) -> Result<()> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let out_dir = config.workspace.workroot.join("plan_preflight").join(stamp);
    artifacts::ensure_dir(&out_dir)?;

    artifacts::write_json_report(&out_dir.join("plan_preflight.json"), plan)?;

    // CSV
    let mut csv = String::from(
        "rid,status,reason,docs_total,docs_embeddable,docs_skipped,tokens,quality_p50\n",
    );
    for d in &plan.runs_detail {
        csv.push_str(&format!(
            "{},{},\"{}\",{},{},{},{},{}\n",
            d.rid, d.status, d.reason, d.docs_total, d.docs_embeddable, d.docs_skipped, d.tokens,
            d.quality_p50
        ));
    }
    std::fs::write(out_dir.join("plan_preflight.csv"), csv)?;

    // Markdown
    let mut md = format!(
        "# Plan Preflight Report\n\n**Timestamp:** {}\n**Provider:** {}\n**Model:** {}\n**Dimension:** {}\n\n## Summary\n\n- **Total Runs Planned:** {}\n- **Ready Runs:** {}\n- **Blocked Runs:** {}\n- **Total Embeddable Docs:** {}\n- **Total Skipped Docs:** {}\n- **Total Tokens:** {}\n",
        plan.timestamp,
        plan.provider,
        plan.model,
        plan.dimension,
        plan.total_runs_planned,
        plan.ready_runs,
        plan.blocked_runs,
        plan.total_embeddable_docs,
        plan.total_skipped_docs,
        plan.total_tokens,
    );
    if let Some(cost) = plan.estimated_cost_usd {
        md.push_str(&format!("- **Estimated Cost:** ${:.2}\n", cost));
    }
    if let Some(secs) = plan.estimated_seconds {
        md.push_str(&format!("- **Estimated Time:** {:.0}s\n", secs));
    }
    md.push_str("\n| Run ID | Status | Reason | Embeddable | Skipped | Tokens |\n");
    md.push_str("|--------|--------|--------|------------|---------|--------|\n");
    for d in &plan.runs_detail {
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            d.rid, d.status, d.reason, d.docs_embeddable, d.docs_skipped, d.tokens
        ));
    }
    std::fs::write(out_dir.join("plan_preflight.md"), md)?;

    // ready.txt / blocked.txt
    let ready_body: String = ready
        .iter()
        .map(|r| format!("runs/{}\n", r))
        .collect();
    std::fs::write(out_dir.join("ready.txt"), ready_body)?;

    let blocked_body: String = plan
        .runs_detail
        .iter()
        .filter(|d| d.status == "BLOCKED")
        .map(|d| format!("runs/{} # {}\n", d.rid, d.reason))
        .collect();
    std::fs::write(out_dir.join("blocked.txt"), blocked_body)?;

    Ok(())
}
