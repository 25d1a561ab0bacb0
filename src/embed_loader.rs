//! Embed loader: materialize a run's documents, chunks, and embeddings in
//! the relational store.
//!
//! Provider failures degrade instead of aborting: a failed batch falls back
//! to per-item embedding, and an item that still fails is stored as a
//! zero-vector of the declared dimension with the error counted in the
//! assurance report. The one hard refusal is a dimension mismatch against
//! embeddings already in the store, which requires `--reembed-all`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::artifacts;
use crate::config::Config;
use crate::events::{EventEmitter, EventFields, Level, Status};
use crate::manifest;
use crate::models::{ChunkRecord, EnrichedDoc, NormalizedDoc};
use crate::preflight;
use crate::provider::{create_provider, EmbeddingProvider};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub max_docs: Option<usize>,
    pub max_chunks: Option<usize>,
    /// Skip documents whose stored enrichment fingerprint matches.
    pub changed_only: bool,
    /// Re-embed everything, overriding skip logic and dimension safety.
    pub reembed_all: bool,
    /// Estimate token usage without calling the provider or writing vectors.
    pub dry_run_cost: bool,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadMetrics {
    pub run_id: String,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub docs_processed: u64,
    pub docs_skipped_unchanged: u64,
    pub docs_skipped_quality: u64,
    pub chunks_upserted: u64,
    pub embeddings_upserted: u64,
    pub embedding_errors: u64,
    pub zero_vectors: u64,
    pub estimated_tokens: i64,
    pub dry_run: bool,
    pub duration_seconds: f64,
    pub completed_at: String,
}

fn parse_ts(value: &Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Existing embedding dimensions in the store for a provider.
async fn existing_dims(pool: &PgPool, provider: &str) -> Result<Vec<i32>> {
    let rows: Vec<(i32,)> =
        sqlx::query_as("SELECT DISTINCT dim FROM chunk_embeddings WHERE provider = $1")
            .bind(provider)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

async fn upsert_document(
    pool: &PgPool,
    run_id: &str,
    doc: &NormalizedDoc,
    enriched: Option<&EnrichedDoc>,
    fingerprint: Option<&str>,
) -> Result<()> {
    let mut meta = serde_json::json!({
        "run_id": run_id,
        "labels": doc.labels,
        "links": doc.links,
        "attachments": doc.attachments,
    });
    let map = meta.as_object_mut().expect("meta object");
    if let Some(fp) = fingerprint {
        map.insert("enrichment_fingerprint".into(), fp.into());
    }
    if let Some(e) = enriched {
        map.insert("collection".into(), e.collection.clone().into());
        map.insert("path_tags".into(), e.path_tags.clone().into());
        map.insert("quality_score".into(), e.quality_score.into());
    }

    sqlx::query(
        r#"
        INSERT INTO documents (doc_id, source_system, title, space_key, url,
                               created_at, updated_at, body_repr, content_sha256, meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (doc_id) DO UPDATE SET
            source_system = EXCLUDED.source_system,
            title = EXCLUDED.title,
            space_key = EXCLUDED.space_key,
            url = EXCLUDED.url,
            created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at,
            body_repr = EXCLUDED.body_repr,
            content_sha256 = EXCLUDED.content_sha256,
            meta = EXCLUDED.meta
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.source_system)
    .bind(&doc.title)
    .bind(&doc.space_key)
    .bind(&doc.url)
    .bind(parse_ts(&doc.created_at))
    .bind(parse_ts(&doc.updated_at))
    .bind(&doc.body_repr)
    .bind(&doc.content_sha256)
    .bind(&meta)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_chunk(pool: &PgPool, chunk: &ChunkRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (chunk_id, doc_id, ord, text_md, char_count, token_count)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (chunk_id) DO UPDATE SET
            ord = EXCLUDED.ord,
            text_md = EXCLUDED.text_md,
            char_count = EXCLUDED.char_count,
            token_count = EXCLUDED.token_count
        "#,
    )
    .bind(&chunk.chunk_id)
    .bind(&chunk.doc_id)
    .bind(chunk.ord as i32)
    .bind(&chunk.text_md)
    .bind(chunk.char_count as i32)
    .bind(chunk.token_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_embedding(
    pool: &PgPool,
    chunk_id: &str,
    provider: &str,
    dim: usize,
    vector: Vec<f32>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunk_embeddings (chunk_id, provider, dim, embedding, created_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (chunk_id, provider) DO UPDATE SET
            dim = EXCLUDED.dim,
            embedding = EXCLUDED.embedding,
            created_at = EXCLUDED.created_at
        "#,
    )
    .bind(chunk_id)
    .bind(provider)
    .bind(dim as i32)
    .bind(pgvector::Vector::from(vector))
    .execute(pool)
    .await?;
    Ok(())
}

struct PendingBatch {
    chunk_ids: Vec<String>,
    texts: Vec<String>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            chunk_ids: Vec::new(),
            texts: Vec::new(),
        }
    }

    fn push(&mut self, chunk_id: String, text: String) {
        self.chunk_ids.push(chunk_id);
        self.texts.push(text);
    }

    fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    fn take(&mut self) -> (Vec<String>, Vec<String>) {
        (
            std::mem::take(&mut self.chunk_ids),
            std::mem::take(&mut self.texts),
        )
    }
}

/// Embed one batch, degrading batch → per-item → zero-vector.
async fn flush_batch(
    pool: &PgPool,
    provider: &dyn EmbeddingProvider,
    batch: &mut PendingBatch,
    metrics: &mut LoadMetrics,
    emitter: &mut EventEmitter,
) -> Result<()> {
    if batch.len() == 0 {
        return Ok(());
    }
    let (chunk_ids, texts) = batch.take();
    let dim = provider.dimension();

    let vectors = match provider.embed_batch(&texts).await {
        Ok(vectors) => vectors,
        Err(e) => {
            emitter.emit(
                Level::Warning,
                "embed.batch",
                Status::Fail,
                EventFields {
                    reason: Some(e.to_string()),
                    ..Default::default()
                },
            );
            // Fall back to single-item embedding; zero-vector any stragglers.
            let mut vectors = Vec::with_capacity(texts.len());
            for text in &texts {
                match provider.embed(text).await {
                    Ok(v) => vectors.push(v),
                    Err(item_err) => {
                        metrics.embedding_errors += 1;
                        metrics.zero_vectors += 1;
                        emitter.emit(
                            Level::Warning,
                            "embed.item",
                            Status::Fail,
                            EventFields {
                                reason: Some(item_err.to_string()),
                                ..Default::default()
                            },
                        );
                        vectors.push(vec![0.0; dim]);
                    }
                }
            }
            vectors
        }
    };

    for (chunk_id, vector) in chunk_ids.iter().zip(vectors.into_iter()) {
        if vector.len() != dim {
            bail!(
                "Provider returned vector of length {} for declared dim {}",
                vector.len(),
                dim
            );
        }
        upsert_embedding(pool, chunk_id, provider.provider_name(), dim, vector).await?;
        metrics.embeddings_upserted += 1;
    }
    emitter.ok(
        "embed.batch",
        EventFields {
            provider: Some(provider.provider_name().to_string()),
            dimension: Some(dim),
            ..Default::default()
        },
    );
    Ok(())
}

/// Load a run into the relational store: upsert documents and chunks, embed
/// chunk texts in batches, and write the assurance report and manifest.
pub async fn load_run(
    config: &Config,
    pool: &PgPool,
    run_id: &str,
    opts: &LoadOptions,
    emitter: &mut EventEmitter,
) -> Result<LoadMetrics> {
    let workroot = &config.workspace.workroot;
    let started = std::time::Instant::now();
    emitter.start("embed.load");

    let normalized_path =
        artifacts::phase_dir(workroot, run_id, "normalize").join("normalized.ndjson");
    let chunks_path = artifacts::phase_dir(workroot, run_id, "chunk").join("chunks.ndjson");
    for path in [&normalized_path, &chunks_path] {
        if !path.exists() {
            let reason = format!("Missing input artifact: {}", path.display());
            emitter.fail("embed.load", &reason, started.elapsed().as_millis() as u64);
            bail!(reason);
        }
    }

    let provider = create_provider(&config.embedding)?;
    let dim = provider.dimension();

    // Dimension safety: refuse to mix dimensions for one provider.
    if !opts.reembed_all {
        let dims = existing_dims(pool, provider.provider_name()).await?;
        if let Some(other) = dims.iter().find(|d| **d != dim as i32) {
            let reason = format!(
                "DimensionMismatch: store holds dim {} for provider '{}', requested {} \
                 (use --reembed-all to replace)",
                other,
                provider.provider_name(),
                dim
            );
            emitter.fail("embed.load", &reason, started.elapsed().as_millis() as u64);
            bail!(reason);
        }
    }

    let (docs, _) = artifacts::read_ndjson_lossy::<NormalizedDoc>(&normalized_path)?;
    let (all_chunks, _) = artifacts::read_ndjson_lossy::<ChunkRecord>(&chunks_path)?;

    // Enrichment artifacts are preferred input; the loader still works from
    // normalized records alone when the enrich phase was skipped.
    let enriched_path = artifacts::phase_dir(workroot, run_id, "enrich").join("enriched.jsonl");
    let enriched_by_id: HashMap<String, EnrichedDoc> = if enriched_path.exists() {
        let (enriched, _): (Vec<EnrichedDoc>, usize) =
            artifacts::read_ndjson_lossy(&enriched_path)?;
        enriched.into_iter().map(|e| (e.id.clone(), e)).collect()
    } else {
        HashMap::new()
    };

    let fingerprints_path =
        artifacts::phase_dir(workroot, run_id, "enrich").join("fingerprints.jsonl");
    let fingerprint_by_id: HashMap<String, String> = if fingerprints_path.exists() {
        let (records, _): (Vec<crate::models::FingerprintRecord>, usize) =
            artifacts::read_ndjson_lossy(&fingerprints_path)?;
        records
            .into_iter()
            .map(|r| (r.id, r.fingerprint_sha256))
            .collect()
    } else {
        HashMap::new()
    };

    let skiplist: std::collections::HashSet<String> =
        preflight::load_skiplist(config, run_id).into_iter().collect();

    let mut chunks_by_doc: HashMap<String, Vec<ChunkRecord>> = HashMap::new();
    for chunk in all_chunks {
        chunks_by_doc.entry(chunk.doc_id.clone()).or_default().push(chunk);
    }

    let mut metrics = LoadMetrics {
        run_id: run_id.to_string(),
        provider: provider.provider_name().to_string(),
        model: provider.model_name().to_string(),
        dimension: dim,
        docs_processed: 0,
        docs_skipped_unchanged: 0,
        docs_skipped_quality: 0,
        chunks_upserted: 0,
        embeddings_upserted: 0,
        embedding_errors: 0,
        zero_vectors: 0,
        estimated_tokens: 0,
        dry_run: opts.dry_run_cost,
        duration_seconds: 0.0,
        completed_at: String::new(),
    };

    let batch_size = opts.batch_size.unwrap_or(config.embedding.batch_size).max(1);
    let mut batch = PendingBatch::new();
    let mut chunks_seen = 0usize;

    'docs: for doc in docs.iter().take(opts.max_docs.unwrap_or(usize::MAX)) {
        if skiplist.contains(&doc.id) {
            metrics.docs_skipped_quality += 1;
            continue;
        }

        let fingerprint = fingerprint_by_id.get(&doc.id).map(|s| s.as_str());

        if opts.changed_only && !opts.reembed_all {
            if let Some(current_fp) = fingerprint {
                let stored: Option<String> = sqlx::query_scalar(
                    "SELECT meta->>'enrichment_fingerprint' FROM documents WHERE doc_id = $1",
                )
                .bind(&doc.id)
                .fetch_optional(pool)
                .await?
                .flatten();
                if stored.as_deref() == Some(current_fp) {
                    metrics.docs_skipped_unchanged += 1;
                    continue;
                }
            }
        }

        if !opts.dry_run_cost {
            upsert_document(pool, run_id, doc, enriched_by_id.get(&doc.id), fingerprint).await?;
        }
        metrics.docs_processed += 1;
        emitter.add_counts(1, 0, 0);

        let Some(chunks) = chunks_by_doc.get(&doc.id) else {
            continue;
        };
        for chunk in chunks {
            if let Some(max) = opts.max_chunks {
                if chunks_seen >= max {
                    break 'docs;
                }
            }
            chunks_seen += 1;
            metrics.estimated_tokens += chunk.token_count;
            emitter.add_counts(0, 1, chunk.token_count as u64);

            if opts.dry_run_cost {
                continue;
            }

            upsert_chunk(pool, chunk).await?;
            metrics.chunks_upserted += 1;

            batch.push(chunk.chunk_id.clone(), chunk.text_md.clone());
            if batch.len() >= batch_size {
                flush_batch(pool, provider.as_ref(), &mut batch, &mut metrics, emitter).await?;
            }
        }
    }

    if !opts.dry_run_cost {
        flush_batch(pool, provider.as_ref(), &mut batch, &mut metrics, emitter).await?;
    }

    metrics.duration_seconds = started.elapsed().as_secs_f64();
    metrics.completed_at = artifacts::now_iso();

    let embed_dir = artifacts::phase_dir(workroot, run_id, "embed");
    artifacts::write_json_report(&embed_dir.join("embed_assurance.json"), &metrics)
        .context("Failed to write embed assurance")?;

    if !opts.dry_run_cost {
        let m = manifest::build_manifest(
            config,
            run_id,
            provider.provider_name(),
            provider.model_name(),
            dim,
            metrics.embeddings_upserted,
        )?;
        manifest::write_manifest(config, &m)?;
    }

    emitter.end("embed.load", started.elapsed().as_millis() as u64);
    Ok(metrics)
}

/// Outcome of [`embed_if_changed`].
#[derive(Debug, Serialize)]
pub struct EmbedOutcome {
    pub skipped: bool,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<LoadMetrics>,
}

/// Preflight → manifest diff → embed only when something changed.
pub async fn embed_if_changed(
    config: &Config,
    pool: &PgPool,
    run_id: &str,
    opts: &LoadOptions,
    emitter: &mut EventEmitter,
) -> Result<EmbedOutcome> {
    let pf_opts = preflight::PreflightOptions::from_config(config);
    let pf = preflight::preflight_run(config, run_id, &pf_opts)?;
    if !pf.is_ready() {
        bail!(
            "Preflight blocked run {}: {}",
            run_id,
            pf.reasons.join(", ")
        );
    }

    let prior_path = manifest::manifest_path(config, run_id);
    if prior_path.exists() {
        let previous = manifest::load_manifest(&prior_path)?;
        let current = manifest::build_manifest(
            config,
            run_id,
            &pf_opts.provider,
            &pf_opts.model,
            pf_opts.dimension,
            0,
        )?;
        let (changed, reasons) = manifest::compare_manifests(&current, &previous);
        if !changed {
            emitter.ok(
                "embed.skip_unchanged",
                EventFields {
                    provider: Some(pf_opts.provider.clone()),
                    ..Default::default()
                },
            );
            return Ok(EmbedOutcome {
                skipped: true,
                reasons: Vec::new(),
                metrics: None,
            });
        }
        let report = manifest::diff_report(&current, &previous, changed, &reasons);
        let embed_dir =
            artifacts::phase_dir(&config.workspace.workroot, run_id, "embed");
        artifacts::write_json_report(&embed_dir.join("diff.json"), &report)?;
        std::fs::write(
            embed_dir.join("diff.md"),
            manifest::format_diff_markdown(&report),
        )?;

        let metrics = load_run(config, pool, run_id, opts, emitter).await?;
        return Ok(EmbedOutcome {
            skipped: false,
            reasons: reasons.iter().map(|r| r.to_string()).collect(),
            metrics: Some(metrics),
        });
    }

    let metrics = load_run(config, pool, run_id, opts, emitter).await?;
    Ok(EmbedOutcome {
        skipped: false,
        reasons: Vec::new(),
        metrics: Some(metrics),
    })
}
