use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use trailblazer::backlog::{self, Phase, ResetScope};
use trailblazer::chunk;
use trailblazer::config;
use trailblazer::db;
use trailblazer::embed_loader::{self, LoadOptions};
use trailblazer::enrich::{self, EnrichOptions};
use trailblazer::events::EventEmitter;
use trailblazer::migrate;
use trailblazer::pipeline;
use trailblazer::preflight::{self, PreflightOptions};
use trailblazer::retrieve::{self, RetrieveOptions};

#[derive(Parser)]
#[command(
    name = "tb",
    about = "Trailblazer — multi-source documentation ingestion and hybrid retrieval",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/tb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Database administration
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Enrich a run's normalized documents
    Enrich {
        /// Run ID to process
        run_id: String,

        /// Enable the LLM overlay (summaries, keywords, edges)
        #[arg(long)]
        llm: bool,

        /// Limit number of documents processed
        #[arg(long)]
        max_docs: Option<usize>,

        /// Soft budget label recorded with the run
        #[arg(long)]
        budget: Option<String>,
    },

    /// Chunk a run's documents into token-bounded pieces
    Chunk {
        /// Run ID to process
        run_id: String,
    },

    /// Validate a run (or a plan of runs) for embedding
    Preflight {
        /// Run ID to check
        run_id: Option<String>,

        /// Plan file with one run per line
        #[arg(long, conflicts_with = "run_id")]
        plan: Option<PathBuf>,
    },

    /// Load documents, chunks, and embeddings into the database
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Run parallel workers draining the backlog for a phase
    Workers {
        /// Phase to drain: chunk or embed
        phase: String,

        /// Number of parallel workers (defaults to config)
        #[arg(long)]
        workers: Option<usize>,

        /// Embed phase: only re-embed changed documents
        #[arg(long)]
        changed_only: bool,
    },

    /// Backlog management
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Query the hybrid retriever
    Ask {
        /// Query text
        query: String,

        /// Maximum number of hits
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to these space keys
        #[arg(long, value_delimiter = ',')]
        spaces: Option<Vec<String>>,

        /// Character budget for the packed context
        #[arg(long)]
        max_chars: Option<usize>,

        /// Emit the full retrieval response as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Check connectivity and pgvector availability
    Doctor,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed a run unconditionally
    Load {
        run_id: String,

        #[arg(long)]
        max_docs: Option<usize>,

        #[arg(long)]
        max_chunks: Option<usize>,

        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,

        /// Skip documents whose enrichment fingerprint is unchanged
        #[arg(long)]
        changed_only: bool,

        /// Re-embed everything, overriding skips and dimension safety
        #[arg(long)]
        reembed_all: bool,

        /// Estimate token usage without calling the provider
        #[arg(long)]
        dry_run_cost: bool,
    },

    /// Embed a run only when the manifest diff reports changes
    IfChanged {
        run_id: String,

        #[arg(long)]
        changed_only: bool,

        #[arg(long)]
        reembed_all: bool,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// Register a normalized run in the backlog
    Register {
        run_id: String,

        /// Source system: confluence or dita
        #[arg(long, default_value = "confluence")]
        source: String,

        #[arg(long, default_value_t = 0)]
        total_docs: i32,
    },

    /// Show the claimable backlog for a phase
    Status {
        /// Phase: chunk or embed
        phase: String,
    },

    /// Return runs to a re-runnable state
    Reset {
        /// Run IDs to reset (all rows when omitted)
        run_ids: Vec<String>,

        /// Scope: processed, embeddings, or all
        #[arg(long, default_value = "processed")]
        scope: String,

        #[arg(long)]
        dry_run: bool,

        /// Required for destructive scopes
        #[arg(long)]
        confirm: bool,
    },
}

fn parse_phase(phase: &str) -> Result<Phase> {
    match phase {
        "chunk" => Ok(Phase::Chunk),
        "embed" => Ok(Phase::Embed),
        other => anyhow::bail!("Unknown phase: {}. Use chunk or embed.", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Db { action } => match action {
            DbAction::Doctor => {
                let pool = db::connect(&cfg).await?;
                let health = db::health(&pool).await?;
                println!("{}", serde_json::to_string_pretty(&health)?);
                pool.close().await;
            }
        },
        Commands::Enrich {
            run_id,
            llm,
            max_docs,
            budget,
        } => {
            let mut emitter =
                EventEmitter::new(&cfg.workspace.workroot, &run_id, "enrich", cfg.logging.rotation_mb)?;
            let opts = EnrichOptions {
                llm_enabled: llm,
                max_docs,
                budget,
            };
            let stats = enrich::enrich_run(&cfg, &run_id, &opts, &mut emitter)?;
            println!("enrich {}", run_id);
            println!("  docs: {}", stats.docs_total);
            println!("  parse errors: {}", stats.parse_errors);
            println!(
                "  below quality threshold: {} ({:.1}%)",
                stats.below_threshold_count,
                stats.below_threshold_pct * 100.0
            );
            if llm {
                println!("  suggested edges: {}", stats.suggested_edges_total);
            }
            println!("ok");
        }
        Commands::Chunk { run_id } => {
            let mut emitter =
                EventEmitter::new(&cfg.workspace.workroot, &run_id, "chunk", cfg.logging.rotation_mb)?;
            let stats = chunk::chunk_run(&cfg, &run_id, &mut emitter)?;
            println!("chunk {}", run_id);
            println!("  docs: {}", stats.docs_total);
            println!("  chunks: {}", stats.chunks_total);
            println!("  atomic overflows: {}", stats.atomic_overflows);
            println!("ok");
        }
        Commands::Preflight { run_id, plan } => {
            let opts = PreflightOptions::from_config(&cfg);
            if let Some(plan_file) = plan {
                let result = preflight::preflight_plan(&cfg, &plan_file, &opts)?;
                println!(
                    "plan preflight: {} ready, {} blocked, {} tokens",
                    result.ready_runs, result.blocked_runs, result.total_tokens
                );
            } else if let Some(run_id) = run_id {
                let result = preflight::preflight_run(&cfg, &run_id, &opts)?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                anyhow::bail!("Provide a run ID or --plan <file>");
            }
        }
        Commands::Embed { action } => match action {
            EmbedAction::Load {
                run_id,
                max_docs,
                max_chunks,
                batch_size,
                changed_only,
                reembed_all,
                dry_run_cost,
            } => {
                let pool = db::connect(&cfg).await?;
                let mut emitter = EventEmitter::new(
                    &cfg.workspace.workroot,
                    &run_id,
                    "embed",
                    cfg.logging.rotation_mb,
                )?;
                let opts = LoadOptions {
                    max_docs,
                    max_chunks,
                    changed_only,
                    reembed_all,
                    dry_run_cost,
                    batch_size,
                };
                let metrics =
                    embed_loader::load_run(&cfg, &pool, &run_id, &opts, &mut emitter).await?;
                println!("{}", serde_json::to_string_pretty(&metrics)?);
                pool.close().await;
            }
            EmbedAction::IfChanged {
                run_id,
                changed_only,
                reembed_all,
            } => {
                let pool = db::connect(&cfg).await?;
                let mut emitter = EventEmitter::new(
                    &cfg.workspace.workroot,
                    &run_id,
                    "embed",
                    cfg.logging.rotation_mb,
                )?;
                let opts = LoadOptions {
                    changed_only,
                    reembed_all,
                    ..Default::default()
                };
                let outcome =
                    embed_loader::embed_if_changed(&cfg, &pool, &run_id, &opts, &mut emitter)
                        .await?;
                if outcome.skipped {
                    println!("embed {} — unchanged, skipped", run_id);
                } else {
                    println!("embed {} — reasons: {}", run_id, outcome.reasons.join(", "));
                }
                pool.close().await;
            }
        },
        Commands::Workers {
            phase,
            workers,
            changed_only,
        } => {
            let phase = parse_phase(&phase)?;
            let count = workers.unwrap_or(cfg.coordination.workers);
            let load_opts = LoadOptions {
                changed_only,
                ..Default::default()
            };
            let report = pipeline::run_workers(&cfg, phase, count, load_opts).await?;
            println!("workers {} ({})", phase.as_str(), report.workers);
            println!("  runs processed: {}", report.runs_processed);
            println!("  runs failed: {}", report.runs_failed);
            if report.shutdown_requested {
                println!("  (shutdown requested)");
            }
        }
        Commands::Runs { action } => match action {
            RunsAction::Register {
                run_id,
                source,
                total_docs,
            } => {
                let pool = db::connect(&cfg).await?;
                backlog::upsert_normalized_run(
                    &pool,
                    &run_id,
                    &source,
                    total_docs,
                    Some(env!("CARGO_PKG_VERSION")),
                )
                .await?;
                pool.close().await;
            }
            RunsAction::Status { phase } => {
                let phase = parse_phase(&phase)?;
                let pool = db::connect(&cfg).await?;
                let summary = backlog::backlog_summary(&pool, phase).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                pool.close().await;
            }
            RunsAction::Reset {
                run_ids,
                scope,
                dry_run,
                confirm,
            } => {
                let scope = ResetScope::parse(&scope)?;
                let pool = db::connect(&cfg).await?;
                let ids = if run_ids.is_empty() {
                    None
                } else {
                    Some(run_ids.as_slice())
                };
                let result = backlog::reset_runs(&pool, ids, scope, dry_run, confirm).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                pool.close().await;
            }
        },
        Commands::Ask {
            query,
            top_k,
            spaces,
            max_chars,
            json,
        } => {
            let pool = db::connect(&cfg).await?;
            let opts = RetrieveOptions {
                top_k,
                space_whitelist: spaces,
                max_chars,
            };
            let result = retrieve::search(&cfg, &pool, &query, &opts).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                if let Some(ref expanded) = result.expanded_query {
                    println!("expanded: {}", expanded);
                }
                if let Some(ref reason) = result.degraded_reason {
                    println!("degraded: {}", reason);
                }
                for (i, hit) in result.hits.iter().enumerate() {
                    let title = if hit.title.is_empty() {
                        "(untitled)"
                    } else {
                        &hit.title
                    };
                    println!("{}. [{:.3}] {} / {}", i + 1, hit.score, hit.source_system, title);
                    if !hit.url.is_empty() {
                        println!("    url: {}", hit.url);
                    }
                    println!("    chunk: {}", hit.chunk_id);
                }
                println!();
                println!(
                    "{} hits over {} documents, {} chars packed in {}ms",
                    result.summary.total_hits,
                    result.summary.unique_documents,
                    result.context.chars().count(),
                    result.summary.timing.total_ms
                );
            }
            pool.close().await;
        }
    }

    Ok(())
}
