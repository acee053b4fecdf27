use std::path::Path;

use tokio::fs::create_dir_all;

use crate::error::Error;
use crate::events::MirrorEvents;
use crate::scraper::{DiscoveredDirectory, DiscoveredFile};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MaterializeSummary {
    pub(crate) created: usize,
    pub(crate) failed: usize,
}

/// Recreates the discovered directory tree locally. Existing directories
/// are fine; a directory that cannot be created is reported and skipped.
pub(crate) async fn materialize(
    directories: &[DiscoveredDirectory],
    files: &[DiscoveredFile],
    events: &dyn MirrorEvents,
) -> MaterializeSummary {
    let mut summary = MaterializeSummary::default();

    let mut targets: Vec<&Path> = directories.iter().map(|d| d.local_path.as_path()).collect();
    if targets.is_empty() {
        // a flat listing records no directory, yet its files need a home
        if let Some(parent) = files.first().and_then(|f| f.local_path.parent()) {
            targets.push(parent);
        }
    }

    for path in targets {
        match create_dir_all(path).await {
            Ok(()) => summary.created += 1,
            Err(e) => {
                summary.failed += 1;
                events.on_directory_failed(path, &Error::from(e));
            }
        }
    }
    summary
}
