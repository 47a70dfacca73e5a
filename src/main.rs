//! # Drivelens CLI
//!
//! The `drivelens` binary drives deployment and operations. All commands
//! accept `--config` pointing to a TOML file; secrets come from the
//! environment (`DRIVE_API_KEY`, `GEMINI_API_KEY`).
//!
//! | Command | Description |
//! |---------|-------------|
//! | `drivelens init` | Run schema migrations (exit 0 even on failure) |
//! | `drivelens serve` | HTTP API + workers + recovery supervisor |
//! | `drivelens work` | Workers and supervisor only, no HTTP |
//! | `drivelens ingest <url>` | Submit a drive folder for processing |
//! | `drivelens sync <folder-id>` | Reconcile a folder against the drive |
//! | `drivelens search <folder-id> <query>` | Query a folder |
//! | `drivelens retry` | Re-queue a failed image or folder |
//! | `drivelens recover` | One recovery sweep |
//! | `drivelens health` | Store/queue connectivity and queue depths |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use drivelens::app::AppContext;
use drivelens::config::load_config;
use drivelens::models::{FOLDER_QUEUE, IMAGE_QUEUE};
use drivelens::recovery::{self, RetryTarget};
use drivelens::{ingest, migrate, search, server, sync, workers};

/// Drivelens — caption, embed, and semantically search every image in a
/// cloud-drive folder.
#[derive(Parser)]
#[command(
    name = "drivelens",
    about = "Caption, embed, and semantically search every image in a cloud-drive folder",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./drivelens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations.
    ///
    /// Idempotent. Exits 0 even when the database is unreachable so a
    /// transient outage never blocks a deployment; the error is logged.
    Init,

    /// Start the HTTP API together with the workers and the recovery
    /// supervisor.
    Serve,

    /// Start the workers and the recovery supervisor without the HTTP API.
    Work,

    /// Submit a drive folder URL for ingestion.
    Ingest {
        /// A drive folder URL, e.g. `https://drive.google.com/drive/folders/…`.
        url: String,
    },

    /// Reconcile a folder against the current drive contents.
    Sync {
        /// Folder id (UUID) as returned by ingest.
        folder_id: Uuid,
    },

    /// Search a folder's corpus.
    Search {
        folder_id: Uuid,
        query: String,

        /// Maximum results (1–50).
        #[arg(long, default_value_t = 12)]
        top_k: i64,
    },

    /// Reset a failed image (or a folder's retryable images) to pending and
    /// re-queue.
    Retry {
        #[arg(long, conflicts_with = "folder")]
        image: Option<Uuid>,

        #[arg(long, conflicts_with = "image")]
        folder: Option<Uuid>,
    },

    /// Run one recovery sweep.
    Recover,

    /// Probe store and queue connectivity and print queue depths.
    Health,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drivelens=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        // Deploy-safe: report, never block the rollout.
        if let Err(e) = migrate::run_migrations(&config).await {
            error!(error = %e, "migrations failed");
            println!("migrations failed (non-fatal): {e:#}");
        } else {
            println!("database initialized");
        }
        return Ok(());
    }

    let ctx = AppContext::build(config).await?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),

        Commands::Serve => {
            let shutdown = shutdown_token();
            let worker_ctx = ctx.clone();
            let worker_shutdown = shutdown.clone();
            let workers = tokio::spawn(async move {
                workers::run(worker_ctx, worker_shutdown).await;
            });

            tokio::select! {
                result = server::run_server(ctx) => result?,
                _ = shutdown.cancelled() => {}
            }
            workers.await?;
        }

        Commands::Work => {
            let shutdown = shutdown_token();
            workers::run(ctx, shutdown).await;
        }

        Commands::Ingest { url } => {
            let snapshot = ingest::submit(
                &ctx,
                ingest::IngestRequest {
                    folder_url: url,
                    user_id: None,
                    credential: None,
                },
            )
            .await?;
            println!("folder: {}", snapshot.id);
            println!("  name: {}", snapshot.name.as_deref().unwrap_or("(unknown)"));
            println!("  status: {}", snapshot.status);
            println!("  images: {}", snapshot.total_images);
        }

        Commands::Sync { folder_id } => {
            let report = sync::sync_folder(&ctx, folder_id, None).await?;
            println!("sync {folder_id}");
            println!("  added: {}", report.added);
            println!("  removed: {}", report.removed);
            println!("  status: {}", report.status);
            println!(
                "  progress: {} / {}",
                report.processed_images, report.total_images
            );
        }

        Commands::Search {
            folder_id,
            query,
            top_k,
        } => {
            let response = search::run_search(&ctx, folder_id, &query, top_k).await?;
            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            println!(
                "{} results ({}, {} ms)",
                response.results.len(),
                response.search_type,
                response.took_ms
            );
            for (i, hit) in response.results.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.similarity, hit.name);
                if let Some(caption) = &hit.caption {
                    println!("    {caption}");
                }
                if !hit.tags.is_empty() {
                    println!("    tags: {}", hit.tags.join(", "));
                }
            }
        }

        Commands::Retry { image, folder } => {
            let target = match (image, folder) {
                (Some(id), None) => RetryTarget::Image(id),
                (None, Some(id)) => RetryTarget::Folder(id),
                _ => anyhow::bail!("pass exactly one of --image or --folder"),
            };
            let queued = recovery::retry(&ctx, target).await?;
            println!("queued: {queued}");
        }

        Commands::Recover => {
            let report = recovery::run_sweep(&ctx).await?;
            println!("reset images: {}", report.reset_images);
            println!("requeued folders: {}", report.requeued_folders);
            println!("stalled jobs: {}", report.stalled_jobs);
            println!("requeued batches: {}", report.requeued_batches);
        }

        Commands::Health => {
            let database = ctx.store.ping().await.is_ok();
            let queue = ctx.queue.ping().await.is_ok();
            println!("database: {}", if database { "ok" } else { "unavailable" });
            println!("queue: {}", if queue { "ok" } else { "unavailable" });
            if queue {
                for name in [FOLDER_QUEUE, IMAGE_QUEUE] {
                    let counts = ctx.queue.counts(name).await?;
                    println!(
                        "  {name}: pending={} active={} completed={} failed={}",
                        counts.pending, counts.active, counts.completed, counts.failed
                    );
                }
            }
            if !database || !queue {
                anyhow::bail!("one or more backends unavailable");
            }
        }
    }

    Ok(())
}

/// Cancellation token fired on the first termination signal: stop claiming
/// jobs, let in-flight work finish.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("termination signal received, draining");
            signal_token.cancel();
        }
    });
    token
}
