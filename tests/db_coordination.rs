//! Database-backed coordination and loader tests.
//!
//! These require a PostgreSQL instance with the pgvector extension and are
//! ignored by default. Run them with:
//!
//! ```bash
//! TRAILBLAZER_TEST_DB_URL=postgres://tb:tb@localhost:5432/tb_test \
//!     cargo test -- --ignored
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use trailblazer::artifacts;
use trailblazer::backlog::{self, Phase};
use trailblazer::config::{Config, DbConfig, EmbeddingConfig, WorkspaceConfig};
use trailblazer::db;
use trailblazer::embed_loader::{self, LoadOptions};
use trailblazer::events::EventEmitter;
use trailblazer::migrate;
use trailblazer::retrieve::{self, RetrieveOptions};

fn db_url() -> Option<String> {
    std::env::var("TRAILBLAZER_TEST_DB_URL").ok()
}

fn test_config(workroot: &Path, url: &str, dims: usize) -> Config {
    Config {
        db: DbConfig {
            url: url.to_string(),
            max_connections: 8,
            statement_timeout_secs: 30,
        },
        workspace: WorkspaceConfig {
            workroot: workroot.to_path_buf(),
        },
        chunking: Default::default(),
        embedding: EmbeddingConfig {
            dims: Some(dims),
            ..Default::default()
        },
        retrieval: Default::default(),
        enrich: Default::default(),
        preflight: Default::default(),
        coordination: Default::default(),
        logging: Default::default(),
    }
}

fn seed_run_artifacts(config: &Config, run_id: &str, doc_id: &str, text: &str) {
    let normalize_dir = artifacts::phase_dir(&config.workspace.workroot, run_id, "normalize");
    std::fs::create_dir_all(&normalize_dir).unwrap();
    let line = serde_json::json!({
        "id": doc_id,
        "title": "Claim Test Page",
        "space_key": "KB",
        "url": "https://example.test/page",
        "text_md": text,
        "source_system": "confluence",
    });
    std::fs::write(
        normalize_dir.join("normalized.ndjson"),
        format!("{}\n", line),
    )
    .unwrap();

    let chunk_dir = artifacts::phase_dir(&config.workspace.workroot, run_id, "chunk");
    std::fs::create_dir_all(&chunk_dir).unwrap();
    let chunk = serde_json::json!({
        "chunk_id": format!("{}:0000", doc_id),
        "doc_id": doc_id,
        "ord": 0,
        "text_md": text,
        "char_count": text.len(),
        "token_count": text.split_whitespace().count(),
        "content_hash": artifacts::sha256_hex(text.as_bytes()),
        "traceability": {"title": "Claim Test Page", "url": "", "source_system": "confluence"},
    });
    std::fs::write(chunk_dir.join("chunks.ndjson"), format!("{}\n", chunk)).unwrap();
}

async fn cleanup(pool: &sqlx::PgPool, prefix: &str) {
    sqlx::query("DELETE FROM processed_runs WHERE run_id LIKE $1")
        .bind(format!("{}%", prefix))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("DELETE FROM documents WHERE doc_id LIKE $1")
        .bind(format!("{}%", prefix))
        .execute(pool)
        .await
        .unwrap();
}

/// Ten runs, four contending workers: every run ends chunked, no run is
/// ever claimed twice.
#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_claim_under_contention() {
    let Some(url) = db_url() else { return };
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &url, 16);
    migrate::run_migrations(&config).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    cleanup(&pool, "test-claim-").await;

    for i in 0..10 {
        backlog::upsert_normalized_run(&pool, &format!("test-claim-{:02}", i), "confluence", 1, None)
            .await
            .unwrap();
    }

    let claimed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let claimed = Arc::clone(&claimed);
        handles.push(tokio::spawn(async move {
            loop {
                let Some(run) = backlog::claim_run(&pool, Phase::Chunk, 60).await.unwrap() else {
                    break;
                };
                if !run.run_id.starts_with("test-claim-") {
                    // Someone else's row: put it back by completing it.
                    backlog::mark_complete(&pool, Phase::Chunk, &run.run_id, 0)
                        .await
                        .unwrap();
                    continue;
                }
                claimed.lock().await.push(run.run_id.clone());
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                backlog::mark_complete(&pool, Phase::Chunk, &run.run_id, 3)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let claimed = claimed.lock().await;
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), 10, "each run claimed exactly once");
    assert_eq!(unique.len(), 10, "no run claimed twice");

    let chunked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processed_runs WHERE run_id LIKE 'test-claim-%' AND status = 'chunked'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(chunked, 10);

    cleanup(&pool, "test-claim-").await;
}

/// A stale claim (claimed_at past the TTL) becomes reclaimable.
#[tokio::test]
#[ignore]
async fn test_stale_claim_recovery() {
    let Some(url) = db_url() else { return };
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &url, 16);
    migrate::run_migrations(&config).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    cleanup(&pool, "test-stale-").await;

    backlog::upsert_normalized_run(&pool, "test-stale-01", "confluence", 1, None)
        .await
        .unwrap();

    // Simulate a crashed worker: claim it, then backdate the claim.
    let run = backlog::claim_run(&pool, Phase::Chunk, 60).await.unwrap().unwrap();
    assert_eq!(run.run_id, "test-stale-01");
    sqlx::query(
        "UPDATE processed_runs SET claimed_at = now() - interval '2 hours' WHERE run_id = $1",
    )
    .bind(&run.run_id)
    .execute(&pool)
    .await
    .unwrap();

    // With a 60 minute TTL the next claim recovers and re-claims it.
    let reclaimed = backlog::claim_run(&pool, Phase::Chunk, 60).await.unwrap().unwrap();
    assert_eq!(reclaimed.run_id, "test-stale-01");

    cleanup(&pool, "test-stale-").await;
}

/// The loader refuses a dimension change for an existing provider unless
/// `reembed_all` is set.
#[tokio::test]
#[ignore]
async fn test_dimension_mismatch_refused() {
    let Some(url) = db_url() else { return };
    let dir = tempfile::tempdir().unwrap();

    let config8 = test_config(dir.path(), &url, 8);
    migrate::run_migrations(&config8).await.unwrap();
    let pool = db::connect(&config8).await.unwrap();
    cleanup(&pool, "test-dim-").await;

    let run_id = "test-dim-run";
    seed_run_artifacts(&config8, run_id, "test-dim-doc", "deployment pipeline details here");

    let mut emitter = EventEmitter::new(dir.path(), run_id, "embed", 16).unwrap();
    embed_loader::load_run(&config8, &pool, run_id, &LoadOptions::default(), &mut emitter)
        .await
        .unwrap();

    // Same provider, different dim: refused.
    let config16 = test_config(dir.path(), &url, 16);
    let err = embed_loader::load_run(
        &config16,
        &pool,
        run_id,
        &LoadOptions::default(),
        &mut emitter,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("DimensionMismatch"));

    // reembed_all overrides.
    let opts = LoadOptions {
        reembed_all: true,
        ..Default::default()
    };
    let metrics = embed_loader::load_run(&config16, &pool, run_id, &opts, &mut emitter)
        .await
        .unwrap();
    assert_eq!(metrics.embeddings_upserted, 1);

    cleanup(&pool, "test-dim-").await;
}

/// Load a run and retrieve it back through the hybrid searcher.
#[tokio::test]
#[ignore]
async fn test_load_then_hybrid_search() {
    let Some(url) = db_url() else { return };
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &url, 16);
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    cleanup(&pool, "test-search-").await;

    let run_id = "test-search-run";
    seed_run_artifacts(
        &config,
        run_id,
        "test-search-doc",
        "The deployment methodology requires a governance checkpoint before go-live.",
    );

    let mut emitter = EventEmitter::new(dir.path(), run_id, "embed", 16).unwrap();
    let metrics =
        embed_loader::load_run(&config, &pool, run_id, &LoadOptions::default(), &mut emitter)
            .await
            .unwrap();
    assert_eq!(metrics.docs_processed, 1);
    assert_eq!(metrics.embeddings_upserted, 1);

    let result = retrieve::search(
        &config,
        &pool,
        "deployment governance checkpoint",
        &RetrieveOptions::default(),
    )
    .await
    .unwrap();
    assert!(!result.hits.is_empty());
    assert_eq!(result.hits[0].doc_id, "test-search-doc");
    assert!(!result.context.is_empty());
    assert_eq!(result.summary.unique_documents, 1);

    cleanup(&pool, "test-search-").await;
}
