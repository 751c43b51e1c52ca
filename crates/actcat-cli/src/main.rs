use std::sync::Arc;

use actcat_adapters::ShellProbe;
use actcat_discovery::{start_scheduler, DiscoveryConfig, DiscoveryEngine, Tick, TickOutcome};
use actcat_storage::CatalogStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "actcat")]
#[command(about = "Action catalog reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the registered sources into the canonical catalog and digest.
    Merge,
    /// Run one discovery update if the catalog is stale.
    Discover {
        /// Skip the staleness check.
        #[arg(long)]
        force: bool,
    },
    /// Run discovery on the configured cron schedule until interrupted.
    Schedule {
        /// Force one update right after startup.
        #[arg(long)]
        now: bool,
    },
    /// Show ledger, catalog totals and the newest report.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Merge) {
        Commands::Merge => {
            let summary = actcat_sync::run_merge_once_from_env().await?;
            println!(
                "merge complete: run_id={} sources={} missing={} failed={} accepted={} rejected={} catalog={} sha256={}",
                summary.run_id,
                summary.sources_loaded,
                summary.sources_missing,
                summary.sources_failed,
                summary.validation.accepted,
                summary.validation.rejected_total(),
                summary.catalog_path,
                summary.catalog_sha256
            );
        }
        Commands::Discover { force } => {
            let engine = open_engine().await?;
            let tick = if force { Tick::Forced } else { Tick::Scheduled };
            match engine.tick(tick).await {
                TickOutcome::NotDue { due_at } => println!("catalog fresh; next update due {due_at}"),
                TickOutcome::Coalesced => println!("update already in flight"),
                TickOutcome::Completed(report) => println!(
                    "discovery complete: run_id={} found={} new={} updated={}",
                    report.run_id, report.actions_found, report.new_actions, report.updated_actions
                ),
                TickOutcome::Failed(report) => anyhow::bail!(
                    "discovery failed in {}: {}",
                    report.phase.as_str(),
                    report.message
                ),
                TickOutcome::Unrecorded { run_id, message } => {
                    anyhow::bail!("discovery run {run_id} could not be recorded: {message}")
                }
            }
        }
        Commands::Schedule { now } => {
            let engine = Arc::new(open_engine().await?);
            let running = start_scheduler(engine).await?;
            if now {
                running.handle().force_update().await?;
            }
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("interrupt received; stopping scheduler");
            running.shutdown().await?;
        }
        Commands::Status => {
            let config = DiscoveryConfig::from_env();
            let store = CatalogStore::open(config.data_dir.clone()).await?;
            let ledger = store.load_ledger().await?;
            println!("last discovery update: {}", ledger.last_update_timestamp);
            match store.load_catalog().await? {
                Some(db) => println!(
                    "catalog: {} actions across {} categories (generated {})",
                    db.metadata.total_actions,
                    db.metadata.categories.len(),
                    db.metadata.generated_at
                ),
                None => println!("catalog: not yet written"),
            }
            match store.latest_report().await? {
                Some(path) => println!("latest report: {}", path.display()),
                None => println!("latest report: none"),
            }
            store.close().await?;
        }
    }

    Ok(())
}

async fn open_engine() -> Result<DiscoveryEngine> {
    let config = DiscoveryConfig::from_env();
    let store = CatalogStore::open(config.data_dir.clone()).await?;
    let probe = Arc::new(ShellProbe::new(config.probe.clone()));
    DiscoveryEngine::open(store, probe, config).await
}
