//! Peer records and the in-memory registry.
//!
//! A peer record is a small JSON file under `org/peers/`, named by the peer's
//! identification. Records replicate between trusted peers through the normal
//! model path; the registry reconciles against the directory on a periodic
//! tick to pick up records that arrived via sync.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peer {
    pub name: String,
    /// Overlay address, also the transport identity.
    pub address: String,
    pub identification: String,
    /// Trusted peers hold plaintext; encrypted peers are blind stores.
    pub trusted: bool,
    /// Runtime only, reset on reconnect.
    #[serde(skip)]
    pub authenticated: bool,
    /// Runtime only: we hold this encrypted peer's write lock.
    #[serde(skip)]
    pub locked: bool,
}

impl Peer {
    pub fn new(name: &str, address: &str, identification: &str, trusted: bool) -> Self {
        Peer {
            name: name.to_string(),
            address: address.to_string(),
            identification: identification.to_string(),
            trusted,
            authenticated: false,
            locked: false,
        }
    }

    pub fn load(path: &Path) -> Result<Peer> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Write the record to `<dir>/<identification>.json`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(format!("{}.json", self.identification));
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn reset_runtime(&mut self) {
        self.authenticated = false;
        self.locked = false;
    }
}

/// Known peers keyed by overlay address. Owned and mutated only by the
/// engine's event loop.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every record under `dir`. Unparsable files are skipped with a
    /// warning so one bad record cannot take the registry down.
    pub fn load(dir: &Path) -> Result<PeerRegistry> {
        let mut registry = PeerRegistry::new();
        registry.reconcile(dir)?;
        Ok(registry)
    }

    /// Re-read the directory, returning peers not previously known.
    pub fn reconcile(&mut self, dir: &Path) -> Result<Vec<Peer>> {
        let mut fresh = Vec::new();
        if !dir.exists() {
            return Ok(fresh);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let peer = match Peer::load(&path) {
                Ok(peer) => peer,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable peer record: {err}");
                    continue;
                }
            };
            if !self.peers.contains_key(&peer.address) {
                self.peers.insert(peer.address.clone(), peer.clone());
                fresh.push(peer);
            }
        }
        Ok(fresh)
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Peer> {
        self.peers.get_mut(address)
    }

    pub fn by_identification(&self, identification: &str) -> Option<&Peer> {
        self.peers
            .values()
            .find(|p| p.identification == identification)
    }

    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.address.clone(), peer);
    }

    pub fn remove(&mut self, address: &str) -> Option<Peer> {
        self.peers.remove(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Identifications of all trusted peers, the removal-completion set.
    pub fn trusted_identifications(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.trusted)
            .map(|p| p.identification.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Contents of `org/self.json`: our own record plus the transport save-blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SelfRecord {
    pub peer: Peer,
    /// Opaque transport state (e.g. the overlay secret key), base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
}

impl SelfRecord {
    pub fn load(path: &Path) -> Result<SelfRecord> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip_skips_runtime_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::new("laptop", "addr-a", "0011223344556677", true);
        peer.authenticated = true;
        peer.locked = true;
        peer.store(dir.path()).unwrap();

        let loaded = Peer::load(&dir.path().join("0011223344556677.json")).unwrap();
        assert_eq!(loaded.name, "laptop");
        assert!(loaded.trusted);
        assert!(!loaded.authenticated);
        assert!(!loaded.locked);
    }

    #[test]
    fn reconcile_reports_only_new_peers() {
        let dir = tempfile::tempdir().unwrap();
        Peer::new("laptop", "addr-a", "0011223344556677", true)
            .store(dir.path())
            .unwrap();

        let mut registry = PeerRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);

        Peer::new("desktop", "addr-b", "8899aabbccddeeff", true)
            .store(dir.path())
            .unwrap();
        let fresh = registry.reconcile(dir.path()).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].address, "addr-b");
        assert!(registry.reconcile(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn trusted_identifications_exclude_encrypted_peers() {
        let mut registry = PeerRegistry::new();
        registry.insert(Peer::new("laptop", "addr-a", "0011223344556677", true));
        registry.insert(Peer::new("store", "addr-e", "8899aabbccddeeff", false));
        let trusted = registry.trusted_identifications();
        assert_eq!(trusted, vec!["0011223344556677".to_string()]);
    }
}
