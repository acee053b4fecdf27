use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::events::MirrorEvents;

/// Byte and file counters for one download phase. Written by every
/// transfer task, read by the reporter.
#[derive(Debug, Default)]
pub(crate) struct TransferProgress {
    bytes_expected: AtomicU64,
    bytes_received: AtomicU64,
    files_completed: AtomicU64,
    files_in_flight: AtomicU64,
}

impl TransferProgress {
    pub(crate) fn add_expected(&self, bytes: u64) {
        self.bytes_expected.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn start_file(&self) {
        self.files_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish_file(&self, completed: bool) {
        self.files_in_flight.fetch_sub(1, Ordering::Relaxed);
        if completed {
            self.files_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A skipped file never goes in flight but still counts as done.
    pub(crate) fn record_skip(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_expected(&self) -> u64 {
        self.bytes_expected.load(Ordering::Relaxed)
    }

    pub(crate) fn files_completed(&self) -> u64 {
        self.files_completed.load(Ordering::Relaxed)
    }

    pub(crate) fn files_in_flight(&self) -> u64 {
        self.files_in_flight.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ProgressSnapshot {
    pub(crate) files_completed: u64,
    pub(crate) files_in_flight: u64,
    pub(crate) bytes_received: u64,
    pub(crate) bytes_expected: u64,
    /// Bytes per second since the previous snapshot.
    pub(crate) throughput: u64,
}

/// Turns successive reads of the received counter into throughput.
struct Sampler {
    last_bytes: u64,
    last_at: Instant,
}

impl Sampler {
    fn new(progress: &TransferProgress, now: Instant) -> Self {
        Self {
            last_bytes: progress.bytes_received(),
            last_at: now,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn sample(&mut self, progress: &TransferProgress, now: Instant) -> ProgressSnapshot {
        let bytes_received = progress.bytes_received();
        let delta = bytes_received.saturating_sub(self.last_bytes);
        let secs = now.saturating_duration_since(self.last_at).as_secs_f64();
        let throughput = if secs > 0.0 {
            (delta as f64 / secs) as u64
        } else {
            0
        };
        self.last_bytes = bytes_received;
        self.last_at = now;

        ProgressSnapshot {
            files_completed: progress.files_completed(),
            files_in_flight: progress.files_in_flight(),
            bytes_received,
            bytes_expected: progress.bytes_expected(),
            throughput,
        }
    }
}

/// Background task publishing a [`ProgressSnapshot`] every interval until
/// [`ProgressReporter::stop`] is called. Dropping the reporter also stops it.
pub(crate) struct ProgressReporter {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub(crate) fn start(
        progress: Arc<TransferProgress>,
        interval: Duration,
        events: Arc<dyn MirrorEvents>,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            let mut sampler = Sampler::new(&progress, Instant::now());
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        events.on_progress(&sampler.sample(&progress, Instant::now()));
                    }
                }
            }
            events.on_progress(&sampler.sample(&progress, Instant::now()));
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the reporter and waits for its final snapshot to be published.
    pub(crate) async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("Progress reporter task failed: {e}");
            }
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
