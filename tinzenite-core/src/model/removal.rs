//! Removal records.
//!
//! A removed object's identification is kept under
//! `removed/<identification>/<peerid>`: one empty file per peer that has
//! acknowledged the removal. The record answers "was this identification
//! removed" long after the staticinfo is gone, which is what keeps stale
//! updates from resurrecting deleted files.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RemovalStore {
    dir: PathBuf,
}

impl RemovalStore {
    pub fn new(dir: PathBuf) -> Self {
        RemovalStore { dir }
    }

    pub fn is_removed(&self, identification: &str) -> bool {
        self.dir.join(identification).is_dir()
    }

    /// Create the record with an initial set of acknowledging peers.
    pub fn record(&self, identification: &str, acknowledged: &[&str]) -> Result<()> {
        let record = self.dir.join(identification);
        fs::create_dir_all(&record)?;
        for peer in acknowledged {
            fs::write(record.join(peer), b"")?;
        }
        Ok(())
    }

    /// Mark `peer` as having acknowledged. Returns `true` when the peer was
    /// not in the set before, `false` for a repeat.
    pub fn acknowledge(&self, identification: &str, peer: &str) -> Result<bool> {
        let record = self.dir.join(identification);
        fs::create_dir_all(&record)?;
        let marker = record.join(peer);
        if marker.exists() {
            return Ok(false);
        }
        fs::write(marker, b"")?;
        Ok(true)
    }

    pub fn acknowledged(&self, identification: &str) -> Result<HashSet<String>> {
        let record = self.dir.join(identification);
        let mut set = HashSet::new();
        if !record.exists() {
            return Ok(set);
        }
        for entry in fs::read_dir(record)? {
            set.insert(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(set)
    }

    /// A removal is complete when every currently known trusted peer has
    /// acknowledged it.
    pub fn is_complete(&self, identification: &str, trusted: &[String]) -> Result<bool> {
        let acknowledged = self.acknowledged(identification)?;
        Ok(trusted.iter().all(|peer| acknowledged.contains(peer)))
    }

    pub fn purge(&self, identification: &str) -> Result<()> {
        let record = self.dir.join(identification);
        if record.exists() {
            fs::remove_dir_all(record)?;
        }
        Ok(())
    }

    /// All identifications with a record.
    pub fn all(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(out)
    }
}
