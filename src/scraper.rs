use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use percent_encoding::percent_decode_str;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::events::MirrorEvents;
use crate::fetch::Fetcher;
use crate::links;

/// Decides whether a fetched page is a directory listing worth expanding.
///
/// A marker match is only a heuristic: an ordinary HTML file that happens to
/// contain the marker will be expanded, and a listing page from a server
/// using different wording will be treated as a leaf.
pub(crate) type ListingPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) fn marker_predicate(marker: &str) -> ListingPredicate {
    let marker = marker.to_string();
    Arc::new(move |page: &str| page.contains(&marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredDirectory {
    /// Remote path, ending in `/`.
    pub(crate) path: String,
    pub(crate) local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredFile {
    pub(crate) url: Url,
    pub(crate) local_path: PathBuf,
}

#[derive(Debug, Default)]
pub(crate) struct CrawlResult {
    pub(crate) directories: Vec<DiscoveredDirectory>,
    pub(crate) files: Vec<DiscoveredFile>,
    /// Listing fetches that ended in a transport error or bad status.
    pub(crate) failed: usize,
}

/// Where the remote tree lives and where it is mirrored to.
#[derive(Debug, Clone)]
pub(crate) struct CrawlTarget {
    pub(crate) root: Url,
    pub(crate) output_dir: PathBuf,
    pub(crate) concurrency: usize,
}

impl CrawlTarget {
    /// Maps a remote path under the root onto the output directory, keeping
    /// the whole remote path: `/pub/a.txt` lands at `<output>/pub/a.txt`.
    ///
    /// Returns `None` for paths outside the root and for segments that
    /// decode to something unsafe on disk, e.g. `%2E%2E` or `a%2Fb`.
    pub(crate) fn local_path(&self, remote_path: &str) -> Option<PathBuf> {
        if !remote_path.starts_with(self.root.path()) {
            return None;
        }
        let mut local = self.output_dir.clone();
        for segment in remote_path.split('/').filter(|s| !s.is_empty()) {
            let segment = percent_decode_str(segment).decode_utf8_lossy();
            if segment == "."
                || segment == ".."
                || segment.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
            {
                return None;
            }
            local.push(&*segment);
        }
        Some(local)
    }
}

#[derive(Default)]
struct CrawlState {
    visited: HashSet<String>,
    seen_files: HashSet<Url>,
    directories: Vec<DiscoveredDirectory>,
    files: Vec<DiscoveredFile>,
    failed: usize,
    outstanding: usize,
}

struct Walker {
    target: CrawlTarget,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<dyn MirrorEvents>,
    is_listing: ListingPredicate,
    slots: Semaphore,
    cancel: CancellationToken,
    state: Mutex<CrawlState>,
    idle: Notify,
}

/// Walks every listing reachable from `target.root` and returns what it
/// found. Failures of single pages are counted, never propagated.
pub(crate) async fn crawl(
    target: CrawlTarget,
    fetcher: Arc<dyn Fetcher>,
    events: Arc<dyn MirrorEvents>,
    is_listing: ListingPredicate,
    cancel: CancellationToken,
) -> CrawlResult {
    let root = target.root.clone();
    let walker = Arc::new(Walker {
        slots: Semaphore::new(target.concurrency),
        target,
        fetcher,
        events,
        is_listing,
        cancel,
        state: Mutex::new(CrawlState::default()),
        idle: Notify::new(),
    });

    walker.lock().visited.insert(root.path().to_string());
    walker.spawn_visit(root);
    walker.idle.notified().await;

    let state = std::mem::take(&mut *walker.lock());
    let mut directories = state.directories;
    let mut files = state.files;
    directories.sort_by(|a, b| a.path.cmp(&b.path));
    files.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));

    CrawlResult {
        directories,
        files,
        failed: state.failed,
    }
}

/// Keeps the outstanding count honest even when a visit panics.
struct VisitGuard {
    walker: Arc<Walker>,
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        let mut state = self.walker.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            // notify_one stores a permit, so `crawl` cannot miss this
            self.walker.idle.notify_one();
        }
    }
}

impl Walker {
    fn lock(&self) -> MutexGuard<'_, CrawlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_visit(self: &Arc<Self>, url: Url) {
        self.lock().outstanding += 1;
        let guard = VisitGuard {
            walker: Arc::clone(self),
        };
        tokio::spawn(async move {
            let walker = Arc::clone(&guard.walker);
            walker.visit(url).await;
            drop(guard);
        });
    }

    async fn visit(self: &Arc<Self>, url: Url) {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            permit = self.slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let body = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            body = self.fetch_listing(&url) => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                self.lock().failed += 1;
                self.events.on_fetch_failed(&url, &e);
                return;
            }
        };
        log::debug!("Hit: {}", url.path());

        let html = String::from_utf8_lossy(&body);
        if !(self.is_listing)(&html) {
            self.events.on_page_skipped(&url);
            return;
        }

        let links = links::extract(&url, &html);
        drop(permit);

        let (directories, files) = self.record(links);
        for directory in &directories {
            self.events.on_directory_discovered(&directory.path);
        }
        for file in &files {
            self.events.on_file_discovered(&file.url);
        }

        for directory in directories {
            let mut next = url.clone();
            next.set_path(&directory.path);
            self.spawn_visit(next);
        }
    }

    async fn fetch_listing(&self, url: &Url) -> crate::error::Result<bytes::Bytes> {
        let response = self.fetcher.fetch(url).await?;
        if !response.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        response.bytes().await
    }

    /// Adds whatever is new to the shared collections and returns it.
    fn record(&self, links: links::Links) -> (Vec<DiscoveredDirectory>, Vec<DiscoveredFile>) {
        let mut new_directories = Vec::new();
        let mut new_files = Vec::new();

        let mut state = self.lock();
        for path in links.directories {
            let Some(local_path) = self.target.local_path(&path) else {
                log::debug!("Ignoring directory outside the root: {path}");
                continue;
            };
            if !state.visited.insert(path.clone()) {
                continue;
            }
            let directory = DiscoveredDirectory { path, local_path };
            state.directories.push(directory.clone());
            new_directories.push(directory);
        }
        for url in links.files {
            let Some(local_path) = self.target.local_path(url.path()) else {
                log::debug!("Ignoring file outside the root: {url}");
                continue;
            };
            if !state.seen_files.insert(url.clone()) {
                continue;
            }
            let file = DiscoveredFile { url, local_path };
            state.files.push(file.clone());
            new_files.push(file);
        }
        (new_directories, new_files)
    }
}
