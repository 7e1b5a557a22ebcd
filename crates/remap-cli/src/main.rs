use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remap_sync::{build_scheduler, RunMode, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "remap-cli")]
#[command(about = "ReMap event catalog reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile enabled providers (or one) into the search index.
    Sync {
        #[arg(long)]
        provider: Option<String>,
        /// Diff against an empty snapshot instead of the retained one.
        #[arg(long)]
        init: bool,
    },
    /// Print the namespaced delta between two local feed files.
    Delta {
        #[arg(long)]
        provider: String,
        old: PathBuf,
        new: PathBuf,
    },
    /// Resolve an address through the geocode cache.
    Resolve { address: String },
    /// Report indexed events that already started; `--apply` deletes them.
    Prune {
        #[arg(long)]
        apply: bool,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,remap_sync=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        provider: None,
        init: false,
    });
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;

    match command {
        Commands::Sync { provider, init } => {
            let mode = if init { RunMode::Initialize } else { RunMode::Incremental };
            match provider {
                Some(id) => {
                    let summary = pipeline.run_provider(&id, mode).await?;
                    print_json(&summary)?;
                    println!(
                        "sync complete: provider={} inserted={} updated={} skipped={} deleted={} failed={} reports={}",
                        summary.provider,
                        summary.inserted,
                        summary.updated,
                        summary.skipped_unchanged,
                        summary.deleted,
                        summary.failed.len(),
                        summary.reports_dir
                    );
                }
                None => {
                    let summary = pipeline.run_all(mode).await?;
                    print_json(&summary)?;
                    println!(
                        "sync complete: run_id={} providers={} failures={} reports={}",
                        summary.run_id,
                        summary.providers.len(),
                        summary.failures.len(),
                        summary.reports_dir
                    );
                }
            }
        }
        Commands::Delta { provider, old, new } => {
            let preview = pipeline.preview_delta(&provider, &old, &new).await?;
            print_json(&preview)?;
        }
        Commands::Resolve { address } => {
            let coords = pipeline
                .resolve_coordinates(&address)
                .await
                .with_context(|| format!("resolving {address:?}"))?;
            print_json(&serde_json::json!({ "address": address, "lon": coords.lon, "lat": coords.lat }))?;
        }
        Commands::Prune { apply } => {
            let report = pipeline.prune_past_events(!apply).await?;
            print_json(&report)?;
            println!(
                "prune {}: cutoff={} scanned={} past={} deleted={} failed={}",
                if report.dry_run { "dry run" } else { "complete" },
                report.cutoff_date,
                report.scanned,
                report.past_events,
                report.deleted,
                report.failed_deletes
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled; set REMAP_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
