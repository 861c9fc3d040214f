//! On-disk layout of the `.tinzenite` bookkeeping tree.
//!
//! Everything the engine persists lives under `<root>/.tinzenite/`:
//!
//! ```text
//! org/peers/<peerid>.json    peer records (replicated through the model)
//! org/auth.json              authentication record
//! org/self.json              local peer record + transport save-blob
//! local/model.json           staticinfo snapshot
//! local/boot.json            bootstrap addresses awaiting first exchange
//! temp/<identification>      fetched file awaiting apply
//! receiving/<peer>.<id>      bytes currently being received
//! sending/<identification>   staged payload awaiting upload
//! removed/<id>/<peerid>      per-peer removal acknowledgements
//! ```
//!
//! `receiving/` and `temp/` ARE the in-flight state: they are emptied on
//! startup and peers are re-asked for whatever was lost.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::Result;

pub const TINZENITE_DIR: &str = ".tinzenite";
pub const TINIGNORE: &str = ".tinignore";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Layout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tinzenite(&self) -> PathBuf {
        self.root.join(TINZENITE_DIR)
    }

    pub fn org_dir(&self) -> PathBuf {
        self.tinzenite().join("org")
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.org_dir().join("peers")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.org_dir().join("auth.json")
    }

    pub fn self_file(&self) -> PathBuf {
        self.org_dir().join("self.json")
    }

    pub fn local_dir(&self) -> PathBuf {
        self.tinzenite().join("local")
    }

    pub fn model_file(&self) -> PathBuf {
        self.local_dir().join("model.json")
    }

    pub fn boot_file(&self) -> PathBuf {
        self.local_dir().join("boot.json")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.tinzenite().join("temp")
    }

    pub fn receiving_dir(&self) -> PathBuf {
        self.tinzenite().join("receiving")
    }

    pub fn sending_dir(&self) -> PathBuf {
        self.tinzenite().join("sending")
    }

    pub fn removed_dir(&self) -> PathBuf {
        self.tinzenite().join("removed")
    }

    pub fn tinignore_file(&self) -> PathBuf {
        self.root.join(TINIGNORE)
    }

    /// Path of a fetched file awaiting apply.
    pub fn temp_file(&self, identification: &str) -> PathBuf {
        self.temp_dir().join(identification)
    }

    /// Path a file is written to while being received from `address`.
    pub fn receiving_file(&self, address: &str, identification: &str) -> PathBuf {
        self.receiving_dir()
            .join(format!("{address}.{identification}"))
    }

    /// Path of a staged outgoing payload.
    pub fn sending_file(&self, identification: &str) -> PathBuf {
        self.sending_dir().join(identification)
    }

    /// Resolve a root-relative path to its absolute location.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Create the whole directory skeleton. Idempotent.
    pub fn create(&self) -> Result<()> {
        for dir in [
            self.peers_dir(),
            self.local_dir(),
            self.temp_dir(),
            self.receiving_dir(),
            self.sending_dir(),
            self.removed_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Discard in-flight state from a previous run.
    pub fn clear_transient(&self) -> Result<()> {
        for dir in [self.temp_dir(), self.receiving_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}

/// Root-relative, forward-slash normalized form of `path`, or `None` if
/// `path` does not live under `root`.
pub fn relative(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Terminal name of a root-relative path.
pub fn terminal_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}

/// Parent of a root-relative path, or `None` for top-level entries.
pub fn parent(relative: &str) -> Option<&str> {
    relative.rsplit_once('/').map(|(parent, _)| parent)
}
