mod cli;
mod downloader;
mod error;
mod limit;
mod output;
mod planner;
mod probe;
mod progress;
mod state;
mod utils;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use indicatif::HumanBytes;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use crate::downloader::{build_client, Downloader};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "pdl=debug" } else { "pdl=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = build_client(args.proxy.as_deref())?;
    let downloader = Downloader::new(client, args.download_options());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping workers");
            on_signal.cancel();
        }
    });

    let report = downloader.download(&args.url, cancel).await?;
    println!(
        "Saved {} ({}) in {:.1?} using {} worker(s)",
        report.path.display(),
        HumanBytes(report.total()),
        report.elapsed,
        report.concurrency
    );
    Ok(())
}
