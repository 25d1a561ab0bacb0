//! Processed-runs backlog: claim/mark coordination for parallel workers.
//!
//! Rows in `processed_runs` move through
//! `normalized → chunking → chunked → embedding → embedded`, with `reset`
//! re-entering the claimable set for both phases. Claims take
//! `SELECT ... FOR UPDATE SKIP LOCKED` so contending workers never block
//! each other and never double-claim; a crashed worker's claim is recovered
//! by TTL at the next claim attempt.
//!
//! Every mutation emits an NDJSON backlog event on stdout so a fleet of
//! workers can be tailed uniformly.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Chunk,
    Embed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Chunk => "chunk",
            Phase::Embed => "embed",
        }
    }

    fn active_status(&self) -> &'static str {
        match self {
            Phase::Chunk => "chunking",
            Phase::Embed => "embedding",
        }
    }

    fn done_status(&self) -> &'static str {
        match self {
            Phase::Chunk => "chunked",
            Phase::Embed => "embedded",
        }
    }

    /// Status a stale claim is returned to on recovery.
    fn pre_status(&self) -> &'static str {
        match self {
            Phase::Chunk => "normalized",
            Phase::Embed => "chunked",
        }
    }
}

/// Identifier recorded in `claimed_by`: `<host>-<pid>`.
pub fn worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

/// A run handed to a worker by [`claim_run`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedRun {
    pub run_id: String,
    pub source: String,
    pub normalized_at: DateTime<Utc>,
    pub total_docs: i32,
    pub total_chunks: Option<i32>,
}

fn emit_backlog_event<T: Serialize>(action: &str, payload: &T) {
    let mut record = serde_json::json!({
        "ts": crate::artifacts::now_iso(),
        "action": action,
        "component": "backlog",
        "pid": std::process::id(),
    });
    if let (Some(map), Ok(serde_json::Value::Object(extra))) =
        (record.as_object_mut(), serde_json::to_value(payload))
    {
        for (k, v) in extra {
            map.insert(k, v);
        }
    }
    println!("{}", record);
}

/// UPSERT a run into the backlog after successful normalization.
pub async fn upsert_normalized_run(
    pool: &PgPool,
    run_id: &str,
    source: &str,
    total_docs: i32,
    code_version: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO processed_runs (
            run_id, source, normalized_at, status, total_docs, code_version, updated_at
        ) VALUES ($1, $2, $3, 'normalized', $4, $5, $3)
        ON CONFLICT (run_id) DO UPDATE SET
            source = EXCLUDED.source,
            normalized_at = EXCLUDED.normalized_at,
            status = 'normalized',
            total_docs = EXCLUDED.total_docs,
            code_version = EXCLUDED.code_version,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(run_id)
    .bind(source)
    .bind(now)
    .bind(total_docs)
    .bind(code_version)
    .execute(pool)
    .await?;

    emit_backlog_event(
        "runs.normalized",
        &serde_json::json!({ "run_id": run_id, "source": source, "total_docs": total_docs }),
    );
    Ok(())
}

/// Claim the oldest available run for a phase.
///
/// In one transaction: recover stale claims past the TTL, then take the
/// first claimable row with `FOR UPDATE SKIP LOCKED` (FIFO by
/// `normalized_at`) and move it to the phase's active status. Returns
/// `None` when the backlog is drained — contention is not an error.
pub async fn claim_run(
    pool: &PgPool,
    phase: Phase,
    claim_ttl_minutes: i64,
) -> Result<Option<ClaimedRun>> {
    let claimed_by = worker_id();
    let now = Utc::now();
    let stale_threshold = now - Duration::minutes(claim_ttl_minutes);

    let mut tx = pool.begin().await?;

    let recovered = sqlx::query(
        r#"
        UPDATE processed_runs
        SET status = $1, claimed_by = NULL, claimed_at = NULL
        WHERE status = $2 AND claimed_at < $3
        "#,
    )
    .bind(phase.pre_status())
    .bind(phase.active_status())
    .bind(stale_threshold)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if recovered > 0 {
        emit_backlog_event(
            "runs.claim.recovered",
            &serde_json::json!({ "count": recovered, "phase": phase.as_str() }),
        );
    }

    let run: Option<ClaimedRun> = sqlx::query_as(&format!(
        r#"
        SELECT run_id, source, normalized_at, total_docs, total_chunks
        FROM processed_runs
        WHERE status IN ('{}', 'reset')
        ORDER BY normalized_at ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
        phase.pre_status()
    ))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(run) = run else {
        tx.commit().await?;
        return Ok(None);
    };

    let started_column = match phase {
        Phase::Chunk => "chunk_started_at",
        Phase::Embed => "embed_started_at",
    };
    sqlx::query(&format!(
        r#"
        UPDATE processed_runs
        SET status = $1, claimed_by = $2, claimed_at = $3, {started_column} = $3,
            updated_at = $3
        WHERE run_id = $4
        "#,
    ))
    .bind(phase.active_status())
    .bind(&claimed_by)
    .bind(now)
    .bind(&run.run_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    emit_backlog_event(
        "runs.claim",
        &serde_json::json!({
            "run_id": run.run_id,
            "phase": phase.as_str(),
            "claimed_by": claimed_by,
        }),
    );

    Ok(Some(run))
}

/// Mark a claimed run as complete for its phase, clearing the claim.
pub async fn mark_complete(pool: &PgPool, phase: Phase, run_id: &str, total: i32) -> Result<()> {
    let now = Utc::now();
    let (completed_column, total_column) = match phase {
        Phase::Chunk => ("chunk_completed_at", "total_chunks"),
        Phase::Embed => ("embed_completed_at", "embedded_chunks"),
    };

    sqlx::query(&format!(
        r#"
        UPDATE processed_runs
        SET status = $1, {completed_column} = $2, {total_column} = $3,
            claimed_by = NULL, claimed_at = NULL, updated_at = $2
        WHERE run_id = $4
        "#,
    ))
    .bind(phase.done_status())
    .bind(now)
    .bind(total)
    .bind(run_id)
    .execute(pool)
    .await?;

    emit_backlog_event(
        "runs.complete",
        &serde_json::json!({ "run_id": run_id, "phase": phase.as_str(), "total": total }),
    );
    Ok(())
}

/// Backlog summary for one phase.
#[derive(Debug, Serialize)]
pub struct BacklogSummary {
    pub phase: String,
    pub total: i64,
    pub earliest: Option<String>,
    pub latest: Option<String>,
    pub sample_run_ids: Vec<String>,
}

pub async fn backlog_summary(pool: &PgPool, phase: Phase) -> Result<BacklogSummary> {
    let row: (i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(&format!(
        r#"
        SELECT COUNT(*), MIN(normalized_at), MAX(normalized_at)
        FROM processed_runs
        WHERE status IN ('{}', 'reset')
        "#,
        phase.pre_status()
    ))
    .fetch_one(pool)
    .await?;

    let sample: Vec<(String,)> = sqlx::query_as(&format!(
        r#"
        SELECT run_id FROM processed_runs
        WHERE status IN ('{}', 'reset')
        ORDER BY normalized_at ASC
        LIMIT 10
        "#,
        phase.pre_status()
    ))
    .fetch_all(pool)
    .await?;

    let summary = BacklogSummary {
        phase: phase.as_str().to_string(),
        total: row.0,
        earliest: row.1.map(|t| t.to_rfc3339()),
        latest: row.2.map(|t| t.to_rfc3339()),
        sample_run_ids: sample.into_iter().map(|(id,)| id).collect(),
    };
    emit_backlog_event("runs.scan.complete", &summary);
    Ok(summary)
}

/// Scope of a reset operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Return rows to `reset`; artifacts and DB rows untouched.
    Processed,
    /// Also delete the runs' chunk embeddings.
    Embeddings,
    /// Also delete the runs' chunks and documents.
    All,
}

impl ResetScope {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processed" => Ok(Self::Processed),
            "embeddings" => Ok(Self::Embeddings),
            "all" => Ok(Self::All),
            other => bail!("Unknown reset scope: {}. Use processed, embeddings, or all.", other),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResetResult {
    pub scope: String,
    pub reset_count: u64,
    pub embeddings_deleted: u64,
    pub documents_deleted: u64,
    pub dry_run: bool,
}

/// Reset runs back to a re-runnable state.
///
/// Destructive scopes (`embeddings`, `all`) refuse to run without
/// `confirmed`. `run_ids = None` targets every row.
pub async fn reset_runs(
    pool: &PgPool,
    run_ids: Option<&[String]>,
    scope: ResetScope,
    dry_run: bool,
    confirmed: bool,
) -> Result<ResetResult> {
    if !confirmed && scope != ResetScope::Processed {
        bail!("Destructive reset scopes require --confirm");
    }

    let ids: Option<Vec<String>> = run_ids.map(|ids| ids.to_vec());

    if dry_run {
        let count: i64 = match &ids {
            Some(ids) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM processed_runs WHERE run_id = ANY($1)")
                    .bind(ids)
                    .fetch_one(pool)
                    .await?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM processed_runs")
                .fetch_one(pool)
                .await?,
        };
        return Ok(ResetResult {
            scope: format!("{:?}", scope).to_lowercase(),
            reset_count: count as u64,
            embeddings_deleted: 0,
            documents_deleted: 0,
            dry_run: true,
        });
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let mut embeddings_deleted = 0u64;
    let mut documents_deleted = 0u64;

    // The loader stamps documents.meta->>'run_id', which is what lets a
    // scoped reset find the DB rows belonging to a set of runs.
    if scope == ResetScope::Embeddings || scope == ResetScope::All {
        let sql = match &ids {
            Some(_) => {
                "DELETE FROM chunk_embeddings WHERE chunk_id IN (
                     SELECT c.chunk_id FROM chunks c
                     JOIN documents d ON c.doc_id = d.doc_id
                     WHERE d.meta->>'run_id' = ANY($1))"
            }
            None => "DELETE FROM chunk_embeddings",
        };
        let mut query = sqlx::query(sql);
        if let Some(ref ids) = ids {
            query = query.bind(ids);
        }
        embeddings_deleted = query.execute(&mut *tx).await?.rows_affected();
    }

    if scope == ResetScope::All {
        let sql = match &ids {
            Some(_) => "DELETE FROM documents WHERE meta->>'run_id' = ANY($1)",
            None => "DELETE FROM documents",
        };
        let mut query = sqlx::query(sql);
        if let Some(ref ids) = ids {
            query = query.bind(ids);
        }
        documents_deleted = query.execute(&mut *tx).await?.rows_affected();
    }

    let sql = match &ids {
        Some(_) => {
            "UPDATE processed_runs
             SET status = 'reset',
                 chunk_started_at = NULL, chunk_completed_at = NULL,
                 embed_started_at = NULL, embed_completed_at = NULL,
                 claimed_by = NULL, claimed_at = NULL, updated_at = $2
             WHERE run_id = ANY($1)"
        }
        None => {
            "UPDATE processed_runs
             SET status = 'reset',
                 chunk_started_at = NULL, chunk_completed_at = NULL,
                 embed_started_at = NULL, embed_completed_at = NULL,
                 claimed_by = NULL, claimed_at = NULL, updated_at = $1
             WHERE TRUE"
        }
    };
    let reset_count = match &ids {
        Some(ids) => sqlx::query(sql).bind(ids).bind(now).execute(&mut *tx).await?,
        None => sqlx::query(sql).bind(now).execute(&mut *tx).await?,
    }
    .rows_affected();

    tx.commit().await?;

    let result = ResetResult {
        scope: format!("{:?}", scope).to_lowercase(),
        reset_count,
        embeddings_deleted,
        documents_deleted,
        dry_run: false,
    };
    emit_backlog_event("runs.reset.complete", &result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_status_mapping() {
        assert_eq!(Phase::Chunk.active_status(), "chunking");
        assert_eq!(Phase::Chunk.done_status(), "chunked");
        assert_eq!(Phase::Chunk.pre_status(), "normalized");
        assert_eq!(Phase::Embed.active_status(), "embedding");
        assert_eq!(Phase::Embed.done_status(), "embedded");
        assert_eq!(Phase::Embed.pre_status(), "chunked");
    }

    #[test]
    fn test_worker_id_carries_pid() {
        let id = worker_id();
        assert!(id.ends_with(&std::process::id().to_string()));
        assert!(id.contains('-'));
    }

    #[test]
    fn test_reset_scope_parse() {
        assert_eq!(ResetScope::parse("processed").unwrap(), ResetScope::Processed);
        assert_eq!(ResetScope::parse("embeddings").unwrap(), ResetScope::Embeddings);
        assert_eq!(ResetScope::parse("all").unwrap(), ResetScope::All);
        assert!(ResetScope::parse("everything").is_err());
    }
}
