use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::{RunConfig, DEFAULT_CONCURRENCY, DEFAULT_LISTING_MARKER};
use crate::events::{ConsoleEvents, MirrorEvents, NoEvents};
use crate::fetch::HttpFetcher;
use crate::mirror::{Mirror, MirrorSummary};

mod config;
mod downloader;
mod error;
mod events;
mod fetch;
mod links;
mod materialize;
mod mirror;
mod progress;
mod scraper;
#[cfg(test)]
mod testing;

/// Recursive autoindex downloader.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Root directory listing to mirror
    url: String,

    /// Number of concurrent file downloads
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY, value_parser = positive)]
    concurrent: usize,

    /// Number of listing pages fetched concurrently
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, value_parser = positive)]
    crawl_concurrent: usize,

    /// Directory the tree is mirrored into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Skip files that already exist locally with the remote size
    #[arg(short, long)]
    skip_existing: bool,

    /// Text that identifies a page as a directory listing
    #[arg(long, default_value = DEFAULT_LISTING_MARKER)]
    marker: String,

    /// Seconds between progress updates
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Number of worker threads
    #[arg(long)]
    cpus: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Only log warnings and errors, no progress bar
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,
}

fn positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be greater than 0".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let cpus = args
        .cpus
        .filter(|&n| n > 0)
        .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
        .unwrap_or(1);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cpus)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Could not start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(args, cpus))
}

async fn run(args: Args, cpus: usize) -> ExitCode {
    log::info!("URL: {}", args.url);
    log::info!("Connections: {}", args.concurrent);
    log::info!("Target directory: {}", args.output_dir.display());
    log::info!("Number of CPUs to use: {cpus}");
    if args.debug {
        log::info!("Enabled debug mode");
    }

    let config = match RunConfig::new(&args.url, &args.output_dir) {
        Ok(config) => config
            .with_download_concurrency(args.concurrent)
            .with_crawl_concurrency(args.crawl_concurrent)
            .with_skip_existing(args.skip_existing)
            .with_listing_marker(args.marker)
            .with_progress_interval(Duration::from_secs(args.interval)),
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let fetcher = match HttpFetcher::new() {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            log::error!("Could not build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let console = (!args.quiet).then(|| Arc::new(ConsoleEvents::new()));
    let events: Arc<dyn MirrorEvents> = match &console {
        Some(console) => console.clone(),
        None => Arc::new(NoEvents),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping..");
            on_interrupt.cancel();
        }
    });

    let result = Mirror::new(config, fetcher, events)
        .with_cancellation(cancel)
        .run()
        .await;
    if let Some(console) = console {
        console.finish();
    }

    match result {
        Ok(summary) => {
            report(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn report(summary: &MirrorSummary) {
    let downloads = &summary.downloads;
    log::info!(
        "Found {} files in {} directories, created {} directories",
        summary.files,
        summary.directories,
        summary.materialized.created
    );
    log::info!(
        "Done: {} downloaded, {} skipped, {} failed, {} cancelled ({} bytes in {:.1?})",
        downloads.downloaded,
        downloads.skipped,
        downloads.failed,
        downloads.cancelled,
        downloads.bytes,
        downloads.elapsed
    );
    if summary.listing_failures > 0 {
        log::warn!(
            "{} directory listings could not be read",
            summary.listing_failures
        );
    }
    if summary.materialized.failed > 0 {
        log::warn!(
            "{} directories could not be created",
            summary.materialized.failed
        );
    }
}
