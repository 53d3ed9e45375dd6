use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mokki_sync::{maybe_build_scheduler, PgSink, PipelineConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mokki-cli")]
#[command(about = "Lakeside cabin market tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full listing sync cycle against the latest raw snapshot.
    Sync,
    /// Refresh the healthcare facility directory.
    Facilities,
    /// Create database tables if they do not exist.
    Migrate,
    /// Run the weekly scheduler in the foreground.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = mokki_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} snapshot={} listings={} new={} geocoded={} reports={}",
                summary.run_id,
                summary.snapshot_date,
                summary.listings_total,
                summary.listings_new,
                summary.enrichment.geocoded,
                summary.reports_dir
            );
        }
        Commands::Facilities => {
            let summary = mokki_sync::run_facilities_once_from_env().await?;
            println!(
                "facilities complete: run_id={} total={} geocoded={} unresolved={}",
                summary.run_id,
                summary.facilities_total,
                summary.enrichment.geocoded,
                summary.enrichment.unresolved
            );
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let Some(database_url) = &config.database_url else {
                anyhow::bail!("DATABASE_URL is not set");
            };
            let sink = PgSink::connect(database_url).await?;
            sink.ensure_schema().await?;
            println!("schema ready");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(PipelineConfig::from_env())?);
            match maybe_build_scheduler(Arc::clone(&pipeline)).await? {
                Some(scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    info!("scheduler started, ctrl-c to stop");
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set MOKKI_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
    }

    Ok(())
}
