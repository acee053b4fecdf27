use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

use crate::downloader::FileStats;
use crate::error::Error;
use crate::progress::ProgressSnapshot;

/// Receives everything noteworthy that happens during a run.
///
/// Every method defaults to a no-op. Implementations are called from many
/// tasks at once and must not block.
pub(crate) trait MirrorEvents: Send + Sync {
    fn on_directory_discovered(&self, _path: &str) {}

    fn on_file_discovered(&self, _url: &Url) {}

    /// A page fetched fine but did not look like a directory listing.
    fn on_page_skipped(&self, _url: &Url) {}

    fn on_fetch_failed(&self, _url: &Url, _error: &Error) {}

    fn on_directory_failed(&self, _path: &Path, _error: &Error) {}

    fn on_download_started(&self, _url: &Url, _size: Option<u64>) {}

    fn on_download_completed(&self, _url: &Url, _stats: &FileStats) {}

    fn on_download_skipped(&self, _url: &Url, _path: &Path) {}

    fn on_download_failed(&self, _url: &Url, _error: &Error) {}

    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NoEvents;

impl MirrorEvents for NoEvents {}

/// Terminal output: log records plus one overall byte progress bar.
pub(crate) struct ConsoleEvents {
    bar: ProgressBar,
}

impl ConsoleEvents {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0).with_style(
            ProgressStyle::with_template(
                "{spinner} {msg} {wide_bar} {bytes}/{total_bytes} | {binary_bytes_per_sec} | {elapsed}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl MirrorEvents for ConsoleEvents {
    fn on_directory_discovered(&self, path: &str) {
        log::debug!("Directory: {path}");
    }

    fn on_file_discovered(&self, url: &Url) {
        log::debug!("File: {}", url.path());
    }

    fn on_page_skipped(&self, url: &Url) {
        log::debug!("Not a directory listing, skipping: {url}");
    }

    fn on_fetch_failed(&self, url: &Url, error: &Error) {
        log::warn!("Failed to list {url}: {error}");
    }

    fn on_directory_failed(&self, path: &Path, error: &Error) {
        log::error!("Failed to create {}: {error}", path.display());
    }

    fn on_download_started(&self, url: &Url, size: Option<u64>) {
        self.bar.suspend(|| match size {
            Some(size) => log::debug!("Downloading {} ({size} bytes)", url.path()),
            None => log::debug!("Downloading {} (unknown size)", url.path()),
        });
    }

    fn on_download_completed(&self, url: &Url, stats: &FileStats) {
        self.bar.suspend(|| {
            log::info!(
                "Downloaded {} ({} bytes in {:.2?})",
                url.path(),
                stats.size,
                stats.elapsed
            );
        });
    }

    fn on_download_skipped(&self, url: &Url, path: &Path) {
        self.bar.suspend(|| {
            log::info!("{} already downloaded at {}", url.path(), path.display());
        });
    }

    fn on_download_failed(&self, url: &Url, error: &Error) {
        self.bar
            .suspend(|| log::error!("Download of {url} failed: {error}"));
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.bytes_expected);
        self.bar.set_position(snapshot.bytes_received);
        self.bar.set_message(format!(
            "{} done, {} active",
            snapshot.files_completed, snapshot.files_in_flight
        ));
        log::trace!(
            "progress: {}/{} bytes, {} B/s",
            snapshot.bytes_received,
            snapshot.bytes_expected,
            snapshot.throughput
        );
    }
}
