//! Directory walk feeding the model.
//!
//! I/O trouble on individual entries is logged and the entry skipped, so one
//! unreadable file never aborts a scan; it is simply unchanged this cycle.

use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::matcher::Matcher;
use crate::paths::relative;

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub relative: String,
    pub directory: bool,
    pub modtime: DateTime<Utc>,
}

/// Walk `root` (or a subtree of it) honoring the matcher. Parents are
/// yielded before their children.
pub fn scan(root: &Path, matcher: &Matcher, scope: Option<&str>) -> Vec<ScanEntry> {
    let base = match scope {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };
    if !base.exists() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(&base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match relative(root, entry.path()) {
            // The walk base itself has no relative form when it is the root.
            None => true,
            Some(rel) => !(entry.file_type().is_dir() && matcher.prunes(&rel)),
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("scan skipping entry: {err}");
                continue;
            }
        };
        let Some(rel) = relative(root, entry.path()) else {
            continue;
        };
        let directory = entry.file_type().is_dir();
        if matcher.ignored(&rel, directory) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(path = %rel, "scan cannot stat entry: {err}");
                continue;
            }
        };
        let modified = match metadata.modified() {
            Ok(time) => time,
            Err(err) => {
                tracing::warn!(path = %rel, "scan cannot read modtime: {err}");
                continue;
            }
        };
        entries.push(ScanEntry {
            relative: rel,
            directory,
            modtime: DateTime::<Utc>::from(modified),
        });
    }
    entries
}
