use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use tokio::fs::{remove_file, rename, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::MirrorEvents;
use crate::fetch::{Body, Fetcher};
use crate::progress::TransferProgress;
use crate::scraper::DiscoveredFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileStats {
    pub(crate) size: u64,
    pub(crate) elapsed: Duration,
}

#[derive(Debug)]
enum Outcome {
    Downloaded(FileStats),
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DownloadSummary {
    pub(crate) downloaded: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
    pub(crate) cancelled: usize,
    /// Bytes of the files that completed.
    pub(crate) bytes: u64,
    pub(crate) elapsed: Duration,
}

/// Hidden, process-tagged sibling of `path`, so it cannot be mistaken for
/// another remote entry such as `<name>.part`.
fn part_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}.part", std::process::id()));
    path.with_file_name(name)
}

/// Transfers discovered files to their mirrored paths, at most
/// `concurrency` at a time.
#[derive(Clone)]
pub(crate) struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    events: Arc<dyn MirrorEvents>,
    progress: Arc<TransferProgress>,
    concurrency: usize,
    skip_existing: bool,
    cancel: CancellationToken,
}

impl Downloader {
    pub(crate) fn new(
        fetcher: Arc<dyn Fetcher>,
        events: Arc<dyn MirrorEvents>,
        progress: Arc<TransferProgress>,
        concurrency: usize,
        skip_existing: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            events,
            progress,
            concurrency,
            skip_existing,
            cancel,
        }
    }

    /// Downloads every file and returns once all transfer tasks have
    /// given their slot back. A failed file never affects the others.
    pub(crate) async fn download_all(&self, files: Vec<DiscoveredFile>) -> DownloadSummary {
        let started = Instant::now();
        let slots = Arc::new(Semaphore::new(self.concurrency));

        let mut tasks = JoinSet::new();
        for file in files {
            let downloader = self.clone();
            let slots = Arc::clone(&slots);
            tasks.spawn(async move { downloader.download_one(&slots, file).await });
        }

        let mut summary = DownloadSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Downloaded(stats)) => {
                    summary.downloaded += 1;
                    summary.bytes += stats.size;
                }
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    log::error!("Download task panicked: {e}");
                    summary.failed += 1;
                }
            }
        }
        debug_assert_eq!(slots.available_permits(), self.concurrency);

        summary.elapsed = started.elapsed();
        summary
    }

    async fn download_one(&self, slots: &Semaphore, file: DiscoveredFile) -> Outcome {
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Outcome::Cancelled,
            permit = slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::Cancelled,
            },
        };

        match self.transfer(&file).await {
            Ok(Some(stats)) => {
                self.events.on_download_completed(&file.url, &stats);
                Outcome::Downloaded(stats)
            }
            Ok(None) => {
                self.events.on_download_skipped(&file.url, &file.local_path);
                Outcome::Skipped
            }
            Err(Error::Cancelled) => Outcome::Cancelled,
            Err(e) => {
                self.events.on_download_failed(&file.url, &e);
                Outcome::Failed
            }
        }
    }

    /// Returns `Ok(None)` when the file was skipped as already present.
    async fn transfer(&self, file: &DiscoveredFile) -> Result<Option<FileStats>> {
        let started = Instant::now();

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = self.fetcher.fetch(&file.url) => response?,
        };
        if !response.is_success() {
            return Err(Error::Status {
                url: file.url.to_string(),
                status: response.status,
            });
        }

        if self.skip_existing {
            if let Some(expected) = response.content_length {
                let existing = tokio::fs::metadata(&file.local_path)
                    .await
                    .ok()
                    .filter(|m| m.is_file())
                    .map(|m| m.len());
                if existing == Some(expected) {
                    self.progress.record_skip();
                    return Ok(None);
                }
            }
        }

        self.progress.add_expected(response.content_length.unwrap_or(0));
        self.events
            .on_download_started(&file.url, response.content_length);

        self.progress.start_file();
        let written = self.save(&file.local_path, response.body).await;
        self.progress.finish_file(written.is_ok());

        Ok(Some(FileStats {
            size: written?,
            elapsed: started.elapsed(),
        }))
    }

    /// Streams into a hidden part file and renames it into place once complete.
    /// The part file is removed on any failure.
    async fn save(&self, path: &Path, body: Body) -> Result<u64> {
        let temp_path = part_path(path);
        let result = match self.write_part(&temp_path, body).await {
            Ok(size) => rename(&temp_path, path).await.map(|()| size).map_err(Error::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Err(e) = remove_file(&temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not remove {}: {e}", temp_path.display());
                }
            }
        }
        result
    }

    async fn write_part(&self, temp_path: &Path, mut body: Body) -> Result<u64> {
        let mut writer = BufWriter::new(File::create(temp_path).await?);
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            writer.write_all(&bytes).await?;
            let len = bytes.len() as u64;
            written += len;
            self.progress.add_received(len);
        }
        writer.flush().await?;
        Ok(written)
    }
}
