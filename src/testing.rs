//! In-memory stand-ins for the network and the event sink.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use url::Url;

use crate::downloader::FileStats;
use crate::error::{Error, Result};
use crate::events::MirrorEvents;
use crate::fetch::{FetchResponse, Fetcher};
use crate::progress::ProgressSnapshot;

/// Autoindex-style page linking to `children`.
pub(crate) fn listing(children: &[&str]) -> Vec<u8> {
    let mut html = String::from(
        "<html><head><title>Index of /</title></head><body><h1>Index of /</h1><pre>\
         <a href=\"../\">../</a>\n",
    );
    for child in children {
        html.push_str(&format!("<a href=\"{child}\">{child}</a>\n"));
    }
    html.push_str("</pre></body></html>");
    html.into_bytes()
}

#[derive(Clone)]
struct Resource {
    status: u16,
    body: Bytes,
    declare_length: bool,
    fail_after: Option<usize>,
}

#[derive(Default)]
struct Stats {
    fetches: Mutex<HashMap<String, usize>>,
    body_bytes: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Serves canned resources keyed by URL path; anything else is a 404.
pub(crate) struct StaticFetcher {
    resources: HashMap<String, Resource>,
    chunk_size: usize,
    stats: Arc<Stats>,
}

impl Default for StaticFetcher {
    fn default() -> Self {
        Self {
            resources: HashMap::new(),
            chunk_size: 16,
            stats: Arc::new(Stats::default()),
        }
    }
}

impl StaticFetcher {
    pub(crate) fn page(self, path: &str, body: Vec<u8>) -> Self {
        self.file(path, body)
    }

    pub(crate) fn file(mut self, path: &str, body: Vec<u8>) -> Self {
        self.resources.insert(
            path.to_string(),
            Resource {
                status: 200,
                body: Bytes::from(body),
                declare_length: true,
                fail_after: None,
            },
        );
        self
    }

    pub(crate) fn status(mut self, path: &str, status: u16) -> Self {
        self.resources.insert(
            path.to_string(),
            Resource {
                status,
                body: Bytes::new(),
                declare_length: true,
                fail_after: None,
            },
        );
        self
    }

    pub(crate) fn without_length(mut self, path: &str) -> Self {
        if let Some(resource) = self.resources.get_mut(path) {
            resource.declare_length = false;
        }
        self
    }

    /// The body errors out after `chunks` chunks.
    pub(crate) fn fail_after(mut self, path: &str, chunks: usize) -> Self {
        if let Some(resource) = self.resources.get_mut(path) {
            resource.fail_after = Some(chunks);
        }
        self
    }

    pub(crate) fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub(crate) fn fetch_count(&self, path: &str) -> usize {
        self.stats
            .fetches
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn body_bytes_read(&self) -> u64 {
        self.stats.body_bytes.load(Ordering::SeqCst)
    }

    /// Most response bodies alive at the same time.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchResponse> {
        *self
            .stats
            .fetches
            .lock()
            .unwrap()
            .entry(url.path().to_string())
            .or_default() += 1;

        let resource = self.resources.get(url.path()).cloned().unwrap_or(Resource {
            status: 404,
            body: Bytes::new(),
            declare_length: true,
            fail_after: None,
        });

        let mut chunks: VecDeque<Result<Bytes>> = resource
            .body
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some(after) = resource.fail_after {
            chunks.truncate(after);
            chunks.push_back(Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            ))));
        }

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .peak_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        // give other tasks a chance to overlap with this one
        tokio::task::yield_now().await;

        Ok(FetchResponse {
            status: resource.status,
            content_length: resource
                .declare_length
                .then_some(resource.body.len() as u64),
            body: TrackedBody {
                chunks,
                stats: Arc::clone(&self.stats),
            }
            .boxed(),
        })
    }
}

struct TrackedBody {
    chunks: VecDeque<Result<Bytes>>,
    stats: Arc<Stats>,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = this.chunks.pop_front();
        if let Some(Ok(bytes)) = &next {
            this.stats
                .body_bytes
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        }
        Poll::Ready(next)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remembers every event by label, plus every progress snapshot.
#[derive(Default)]
pub(crate) struct RecordingEvents {
    labels: Mutex<Vec<&'static str>>,
    snapshots: Mutex<Vec<ProgressSnapshot>>,
}

impl RecordingEvents {
    fn push(&self, label: &'static str) {
        self.labels.lock().unwrap().push(label);
    }

    pub(crate) fn count(&self, label: &str) -> usize {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .filter(|l| **l == label)
            .count()
    }

    pub(crate) fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl MirrorEvents for RecordingEvents {
    fn on_directory_discovered(&self, _path: &str) {
        self.push("directory");
    }

    fn on_file_discovered(&self, _url: &Url) {
        self.push("file");
    }

    fn on_page_skipped(&self, _url: &Url) {
        self.push("page_skipped");
    }

    fn on_fetch_failed(&self, _url: &Url, _error: &Error) {
        self.push("fetch_failed");
    }

    fn on_directory_failed(&self, _path: &Path, _error: &Error) {
        self.push("directory_failed");
    }

    fn on_download_started(&self, _url: &Url, _size: Option<u64>) {
        self.push("started");
    }

    fn on_download_completed(&self, _url: &Url, _stats: &FileStats) {
        self.push("completed");
    }

    fn on_download_skipped(&self, _url: &Url, _path: &Path) {
        self.push("skipped");
    }

    fn on_download_failed(&self, _url: &Url, _error: &Error) {
        self.push("failed");
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.snapshots.lock().unwrap().push(*snapshot);
    }
}
