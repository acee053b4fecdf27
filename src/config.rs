use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_CONCURRENCY: usize = 20;
pub(crate) const DEFAULT_LISTING_MARKER: &str = "Index of";

/// Settings for one mirroring run. Built once in `main` and never mutated.
#[derive(Debug, Clone)]
pub(crate) struct RunConfig {
    pub(crate) root: Url,
    pub(crate) crawl_concurrency: usize,
    pub(crate) download_concurrency: usize,
    pub(crate) output_dir: PathBuf,
    pub(crate) skip_existing: bool,
    pub(crate) listing_marker: String,
    pub(crate) progress_interval: Duration,
}

impl RunConfig {
    /// The root path always ends in `/` so that relative hrefs on the root
    /// listing resolve beneath it.
    pub(crate) fn new(root: &str, output_dir: impl AsRef<Path>) -> Result<Self> {
        let mut root = Url::parse(root)?;
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        root.set_fragment(None);

        let output_dir = output_dir.as_ref();
        let output_dir = if output_dir.is_absolute() {
            output_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(output_dir)
        };

        Ok(Self {
            root,
            crawl_concurrency: DEFAULT_CONCURRENCY,
            download_concurrency: DEFAULT_CONCURRENCY,
            output_dir,
            skip_existing: false,
            listing_marker: DEFAULT_LISTING_MARKER.to_string(),
            progress_interval: Duration::from_secs(1),
        })
    }

    pub(crate) fn with_crawl_concurrency(mut self, limit: usize) -> Self {
        self.crawl_concurrency = limit;
        self
    }

    pub(crate) fn with_download_concurrency(mut self, limit: usize) -> Self {
        self.download_concurrency = limit;
        self
    }

    pub(crate) fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub(crate) fn with_listing_marker(mut self, marker: impl Into<String>) -> Self {
        self.listing_marker = marker.into();
        self
    }

    pub(crate) fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !matches!(self.root.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported scheme {:?}, expected http or https",
                self.root.scheme()
            )));
        }
        if self.crawl_concurrency == 0 {
            return Err(Error::Config(
                "crawl concurrency must be greater than 0".to_string(),
            ));
        }
        if self.download_concurrency == 0 {
            return Err(Error::Config(
                "download concurrency must be greater than 0".to_string(),
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(Error::Config(
                "progress interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
