use std::path::Path;
use std::sync::Arc;

use tokio::fs::{remove_file, OpenOptions};
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::downloader::{DownloadSummary, Downloader};
use crate::error::{Error, Result};
use crate::events::MirrorEvents;
use crate::fetch::Fetcher;
use crate::materialize::{materialize, MaterializeSummary};
use crate::progress::{ProgressReporter, TransferProgress};
use crate::scraper::{crawl, marker_predicate, CrawlTarget, ListingPredicate};

#[derive(Debug, Clone, Default)]
pub(crate) struct MirrorSummary {
    pub(crate) directories: usize,
    pub(crate) files: usize,
    pub(crate) listing_failures: usize,
    pub(crate) materialized: MaterializeSummary,
    pub(crate) downloads: DownloadSummary,
}

/// Runs the phases of a mirror in order: writability check, crawl,
/// directory creation, downloads.
pub(crate) struct Mirror {
    config: RunConfig,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<dyn MirrorEvents>,
    is_listing: ListingPredicate,
    cancel: CancellationToken,
}

impl Mirror {
    pub(crate) fn new(
        config: RunConfig,
        fetcher: Arc<dyn Fetcher>,
        events: Arc<dyn MirrorEvents>,
    ) -> Self {
        let is_listing = marker_predicate(&config.listing_marker);
        Self {
            config,
            fetcher,
            events,
            is_listing,
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_listing_predicate(mut self, is_listing: ListingPredicate) -> Self {
        self.is_listing = is_listing;
        self
    }

    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) async fn run(&self) -> Result<MirrorSummary> {
        self.config.validate()?;

        let output_dir = &self.config.output_dir;
        log::info!("Checking permission for: {}", output_dir.display());
        check_writable(output_dir).await?;

        log::info!("Collecting URLs from {}", self.config.root);
        let crawled = crawl(
            CrawlTarget {
                root: self.config.root.clone(),
                output_dir: output_dir.clone(),
                concurrency: self.config.crawl_concurrency,
            },
            Arc::clone(&self.fetcher),
            Arc::clone(&self.events),
            Arc::clone(&self.is_listing),
            self.cancel.clone(),
        )
        .await;
        self.bail_if_cancelled()?;
        log::info!(
            "Total files found: {}, total directories found: {}",
            crawled.files.len(),
            crawled.directories.len()
        );

        log::info!("Creating the same directory structure..");
        let materialized = materialize(&crawled.directories, &crawled.files, &*self.events).await;
        self.bail_if_cancelled()?;

        log::info!("Downloading {} files..", crawled.files.len());
        let mut summary = MirrorSummary {
            directories: crawled.directories.len(),
            files: crawled.files.len(),
            listing_failures: crawled.failed,
            materialized,
            downloads: DownloadSummary::default(),
        };

        let progress = Arc::new(TransferProgress::default());
        let reporter = ProgressReporter::start(
            Arc::clone(&progress),
            self.config.progress_interval,
            Arc::clone(&self.events),
        );
        summary.downloads = Downloader::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.events),
            progress,
            self.config.download_concurrency,
            self.config.skip_existing,
            self.cancel.clone(),
        )
        .download_all(crawled.files)
        .await;
        reporter.stop().await;
        self.bail_if_cancelled()?;

        Ok(summary)
    }

    fn bail_if_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Proves the directory is writable by creating and removing a probe file.
async fn check_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(format!(".{}-probe-{}", env!("CARGO_PKG_NAME"), std::process::id()));
    let not_writable = |source| Error::NotWritable {
        path: dir.to_path_buf(),
        source,
    };

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .await
        .map_err(not_writable)?;
    remove_file(&probe).await.map_err(not_writable)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{listing, RecordingEvents, StaticFetcher};

    fn config(dir: &TempDir) -> RunConfig {
        RunConfig::new("http://example.com/", dir.path())
            .unwrap()
            .with_progress_interval(std::time::Duration::from_millis(5))
    }

    fn sample_site() -> StaticFetcher {
        StaticFetcher::default()
            .page("/", listing(&["sub/", "a.txt"]))
            .page("/sub/", listing(&["b.txt"]))
            .file("/a.txt", vec![b'a'; 100])
            .file("/sub/b.txt", vec![b'b'; 50])
    }

    #[tokio::test]
    async fn mirrors_a_small_tree() {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(RecordingEvents::default());

        let summary = Mirror::new(config(&dir), Arc::new(sample_site()), events.clone())
            .run()
            .await
            .unwrap();

        assert!(dir.path().join("sub").is_dir());
        assert_eq!(std::fs::metadata(dir.path().join("a.txt")).unwrap().len(), 100);
        assert_eq!(std::fs::metadata(dir.path().join("sub/b.txt")).unwrap().len(), 50);
        assert_eq!(summary.directories, 1);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.downloads.downloaded, 2);
        assert_eq!(summary.downloads.bytes, 150);

        let last = *events.snapshots().last().unwrap();
        assert_eq!(last.bytes_received, 150);
        assert_eq!(last.bytes_expected, 150);
        assert_eq!(last.files_completed, 2);
        assert_eq!(last.files_in_flight, 0);
    }

    #[tokio::test]
    async fn nested_root_keeps_the_remote_path() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("http://example.com/pub/linux/", dir.path())
            .unwrap()
            .with_progress_interval(std::time::Duration::from_millis(5));
        let fetcher = StaticFetcher::default()
            .page("/pub/linux/", listing(&["a.txt"]))
            .file("/pub/linux/a.txt", vec![b'a'; 10]);

        let summary = Mirror::new(config, Arc::new(fetcher), Arc::new(RecordingEvents::default()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.directories, 0);
        assert_eq!(summary.materialized.created, 1);
        assert_eq!(summary.downloads.downloaded, 1);
        assert!(dir.path().join("pub/linux/a.txt").is_file());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_skip_existing(true);

        let events = Arc::new(RecordingEvents::default());
        Mirror::new(config.clone(), Arc::new(sample_site()), events)
            .run()
            .await
            .unwrap();
        let fetcher = Arc::new(sample_site());
        let summary = Mirror::new(config, fetcher.clone(), Arc::new(RecordingEvents::default()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.downloads.skipped, 2);
        assert_eq!(summary.downloads.downloaded, 0);
        assert_eq!(fetcher.fetch_count("/a.txt"), 1);
    }

    #[tokio::test]
    async fn unwritable_output_aborts_before_any_fetch() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let config = RunConfig::new("http://example.com/", &missing).unwrap();
        let fetcher = Arc::new(sample_site());

        let result = Mirror::new(config, fetcher.clone(), Arc::new(RecordingEvents::default()))
            .run()
            .await;

        assert!(matches!(result, Err(Error::NotWritable { .. })));
        assert_eq!(fetcher.fetch_count("/"), 0);
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Mirror::new(
            config(&dir).with_download_concurrency(0),
            Arc::new(sample_site()),
            Arc::new(RecordingEvents::default()),
        )
        .run()
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn custom_listing_predicate() {
        let dir = TempDir::new().unwrap();
        let fetcher = StaticFetcher::default()
            .page("/", b"<h2>Files</h2><a href=\"x.txt\">x</a>".to_vec())
            .file("/x.txt", b"x".to_vec());

        let events = Arc::new(RecordingEvents::default());
        let summary = Mirror::new(config(&dir), Arc::new(fetcher), events)
            .with_listing_predicate(marker_predicate("<h2>Files</h2>"))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.downloads.downloaded, 1);
        assert!(dir.path().join("x.txt").is_file());
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = Arc::new(RecordingEvents::default());
        let result = Mirror::new(config(&dir), Arc::new(sample_site()), events)
            .with_cancellation(cancel)
            .run()
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn writability_probe_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        check_writable(dir.path()).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
