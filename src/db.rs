//! PostgreSQL connection management.
//!
//! Each worker opens its own pool; statements carry the configured timeout
//! so a wedged query cannot hold a claim forever.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.db.url)
        .with_context(|| "Invalid database URL")?
        .options([(
            "statement_timeout",
            format!("{}s", config.db.statement_timeout_secs),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| "Failed to connect to database")?;

    Ok(pool)
}

/// Connectivity and capability report for `tb db doctor`.
#[derive(Debug, Serialize)]
pub struct DbHealth {
    pub status: String,
    pub database: String,
    pub pgvector: bool,
}

pub async fn health(pool: &PgPool) -> Result<DbHealth> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Database connectivity check failed")?;

    let database: String = sqlx::query_scalar("SELECT current_database()")
        .fetch_one(pool)
        .await?;

    let pgvector: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pg_extension WHERE extname = 'vector'",
    )
    .fetch_one(pool)
    .await
    .unwrap_or(false);

    Ok(DbHealth {
        status: "ok".to_string(),
        database,
        pgvector,
    })
}
