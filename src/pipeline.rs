//! Worker pool: drain the processed-runs backlog for one phase.
//!
//! Each worker loops claim → process → mark-complete until the backlog is
//! empty. Workers honor a cooperative shutdown signal (Ctrl-C): the current
//! run is finished, then the loop exits. A run that fails mid-phase keeps
//! its active claim row and is recovered by TTL at a later claim, with the
//! failure recorded as a FAIL event in that run's log.

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::watch;

use crate::backlog::{self, Phase};
use crate::chunk;
use crate::config::Config;
use crate::db;
use crate::embed_loader::{self, LoadOptions};
use crate::events::EventEmitter;

#[derive(Debug, Default, Serialize)]
pub struct WorkerReport {
    pub workers: usize,
    pub runs_processed: u64,
    pub runs_failed: u64,
    pub shutdown_requested: bool,
}

/// Process one claimed run for the given phase.
async fn process_run(
    config: &Config,
    pool: &PgPool,
    phase: Phase,
    run: &backlog::ClaimedRun,
    load_opts: &LoadOptions,
) -> Result<i32> {
    let mut emitter = EventEmitter::new(
        &config.workspace.workroot,
        &run.run_id,
        phase.as_str(),
        config.logging.rotation_mb,
    )?;

    match phase {
        Phase::Chunk => {
            let stats = chunk::chunk_run(config, &run.run_id, &mut emitter)?;
            Ok(stats.chunks_total as i32)
        }
        Phase::Embed => {
            let metrics =
                embed_loader::load_run(config, pool, &run.run_id, load_opts, &mut emitter).await?;
            Ok(metrics.embeddings_upserted as i32)
        }
    }
}

/// Run `workers` parallel workers draining the backlog for `phase`.
///
/// Returns when no claimable runs remain or shutdown was requested.
pub async fn run_workers(
    config: &Config,
    phase: Phase,
    workers: usize,
    load_opts: LoadOptions,
) -> Result<WorkerReport> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let config = Arc::new(config.clone());
    let load_opts = Arc::new(load_opts);
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        let config = Arc::clone(&config);
        let load_opts = Arc::clone(&load_opts);
        let shutdown = shutdown_rx.clone();

        handles.push(tokio::spawn(async move {
            // Each worker opens its own pool so a slow statement on one
            // worker never starves another's claim round-trip.
            let pool = match db::connect(&config).await {
                Ok(pool) => pool,
                Err(e) => {
                    eprintln!("worker {}: db connect failed: {}", worker, e);
                    return (0u64, 1u64);
                }
            };

            let mut processed = 0u64;
            let mut failed = 0u64;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let claimed = match backlog::claim_run(
                    &pool,
                    phase,
                    config.coordination.claim_ttl_minutes,
                )
                .await
                {
                    Ok(Some(run)) => run,
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("worker {}: claim failed: {}", worker, e);
                        failed += 1;
                        break;
                    }
                };

                match process_run(&config, &pool, phase, &claimed, &load_opts).await {
                    Ok(total) => {
                        if let Err(e) =
                            backlog::mark_complete(&pool, phase, &claimed.run_id, total).await
                        {
                            eprintln!(
                                "worker {}: mark complete failed for {}: {}",
                                worker, claimed.run_id, e
                            );
                            failed += 1;
                        } else {
                            processed += 1;
                        }
                    }
                    Err(e) => {
                        // Claim row stays active; TTL recovery returns the
                        // run to the backlog.
                        eprintln!("worker {}: run {} failed: {}", worker, claimed.run_id, e);
                        failed += 1;
                    }
                }
            }

            pool.close().await;
            (processed, failed)
        }));
    }

    let mut report = WorkerReport {
        workers,
        ..Default::default()
    };
    for handle in handles {
        let (processed, failed) = handle.await.unwrap_or((0, 1));
        report.runs_processed += processed;
        report.runs_failed += failed;
    }
    report.shutdown_requested = *shutdown_rx.borrow();
    Ok(report)
}
