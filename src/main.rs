//! CLI entry point for the patchfetch tool.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use patchfetch_core::{
    BatchUpdater, HashAddressing, Release, SchedulerOptions, TransferClient, TransferOptions,
    plan_transfers,
};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Patchfetch starting");

    let release = Release::load(&args.manifest)
        .await
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    let addressing = HashAddressing::new(&args.base_url, args.game.clone())
        .context("building CDN addressing")?;
    let planned = plan_transfers(&release, &addressing, &args.output)
        .context("planning transfers")?;

    if planned.is_empty() {
        info!("Manifest lists no files");
        return Ok(());
    }

    let client = TransferClient::new(TransferOptions {
        max_retry: u32::from(args.max_retries),
        timeout: Duration::from_millis(args.timeout_ms),
        verify_hash: !args.no_verify_hash,
        verify_size: !args.no_verify_size,
        hash_algorithm: args.hash_algorithm.into(),
        ..TransferOptions::default()
    })
    .context("creating HTTP client")?;

    let mut scheduler_options = SchedulerOptions::default()
        .with_concurrency(usize::from(args.concurrency))
        .with_carryover(args.carryover);
    if let Some(cap) = args.interval_cap {
        scheduler_options = scheduler_options
            .with_interval_cap(cap as usize, Duration::from_millis(args.interval_ms));
        debug!(cap, interval_ms = args.interval_ms, "rate limiting enabled");
    }

    let updater = BatchUpdater::new(client, scheduler_options)?;
    let update = updater.prepare(planned)?;
    info!(
        files = update.files().len(),
        bytes = release.total_size(),
        "Release planned"
    );

    update.start();
    let stats = update.wait().await;

    info!(
        completed = stats.completed(),
        failed = stats.failed(),
        canceled = stats.canceled(),
        bytes = stats.bytes_received(),
        "Update complete"
    );

    if !stats.is_success() {
        bail!(
            "{} of {} files did not complete",
            stats.failed() + stats.canceled(),
            stats.total()
        );
    }

    Ok(())
}
