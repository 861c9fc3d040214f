//! Per-path metadata persisted across runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::version::VersionVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticInfo {
    pub identification: String,
    pub version: VersionVector,
    pub directory: bool,
    /// Hex content hash, empty for directories.
    #[serde(default)]
    pub content: String,
    pub modtime: DateTime<Utc>,
    #[serde(default)]
    pub shadow: bool,
}

/// Tracked set keyed by root-relative path. A `BTreeMap` keeps snapshots
/// deterministic and iterates parents before their children.
pub type TrackedMap = BTreeMap<String, StaticInfo>;

/// Load the snapshot; a missing file is an empty tracked set.
pub fn load(path: &Path) -> Result<TrackedMap> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TrackedMap::new()),
        Err(err) => Err(err.into()),
    }
}

/// Persist the snapshot. Failures propagate to the caller.
pub fn save(path: &Path, tracked: &TrackedMap) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(tracked)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = load(&dir.path().join("model.json")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut version = VersionVector::new();
        version.set("0011223344556677", 2);
        let mut map = TrackedMap::new();
        map.insert(
            "docs/notes.txt".to_string(),
            StaticInfo {
                identification: "8899aabbccddeeff".into(),
                version,
                directory: false,
                content: crate::hashing::hash_bytes(b"hello"),
                modtime: Utc::now(),
                shadow: false,
            },
        );

        save(&path, &map).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back.len(), 1);
        let info = &back["docs/notes.txt"];
        assert_eq!(info.identification, "8899aabbccddeeff");
        assert_eq!(info.modtime, map["docs/notes.txt"].modtime);
    }
}
