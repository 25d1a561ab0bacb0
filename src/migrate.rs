//! Database schema migrations.
//!
//! Creates all required tables (documents, chunks, chunk_embeddings,
//! processed_runs), the pgvector extension, and the search indexes. Every
//! statement is idempotent; `tb init` can be re-run safely.

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Extension creation can fail on restricted roles; the user can create
    // it manually, and table creation below will surface a clear error.
    if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(&pool)
        .await
    {
        eprintln!("Warning: could not create pgvector extension: {}", e);
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            source_system TEXT NOT NULL,
            title TEXT,
            space_key TEXT,
            url TEXT,
            created_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ,
            body_repr TEXT,
            content_sha256 TEXT,
            meta JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
            ord INTEGER NOT NULL,
            text_md TEXT NOT NULL,
            char_count INTEGER NOT NULL,
            token_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id TEXT NOT NULL REFERENCES chunks(chunk_id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            dim INTEGER NOT NULL,
            embedding vector NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (chunk_id, provider)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_runs (
            run_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            normalized_at TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL,
            total_docs INTEGER NOT NULL DEFAULT 0,
            total_chunks INTEGER,
            embedded_chunks INTEGER,
            claimed_by TEXT,
            claimed_at TIMESTAMPTZ,
            chunk_started_at TIMESTAMPTZ,
            chunk_completed_at TIMESTAMPTZ,
            embed_started_at TIMESTAMPTZ,
            embed_completed_at TIMESTAMPTZ,
            code_version TEXT,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_ord ON chunks(doc_id, ord)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_space_key ON documents(space_key)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_runs_backlog
         ON processed_runs(status, normalized_at)",
    )
    .execute(&pool)
    .await?;

    // BM25 side: GIN index over the tsvector of chunk text.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_chunks_text_tsvector
        ON chunks USING GIN (to_tsvector('english', text_md))
        "#,
    )
    .execute(&pool)
    .await?;

    create_vector_index(&pool, config.embedding.dimension()).await;

    pool.close().await;
    Ok(())
}

/// Dense side: HNSW cosine index for the configured dimension.
///
/// The `embedding` column is untyped so one table can hold several
/// providers with different dims; HNSW needs a typed operand, so the index
/// is a partial expression index over rows of the configured dimension.
/// Failure is non-fatal — retrieval degrades to a sequential scan.
async fn create_vector_index(pool: &PgPool, dim: usize) {
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS idx_chunk_embeddings_hnsw_{dim}
         ON chunk_embeddings
         USING hnsw ((embedding::vector({dim})) vector_cosine_ops)
         WHERE dim = {dim}",
    );
    if let Err(e) = sqlx::query(&sql).execute(pool).await {
        eprintln!(
            "Warning: could not create HNSW index for dim {}: {}",
            dim, e
        );
    }
}
