//! The transfer coordinator.
//!
//! At most one inbound fetch exists per `(peer address, identification)`.
//! Stale records are not reaped eagerly: the next `request` for an expired
//! key retransmits and resets the clock, so a second expiry without receipt
//! never accumulates transfers. Completed fetches land under
//! `temp/<identification>` together with a pending action the event loop
//! executes; a tagged variant stands in for a completion callback.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::messages::UpdateMessage;
use crate::paths::Layout;

pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub address: String,
    pub identification: String,
}

impl TransferKey {
    pub fn new(address: &str, identification: &str) -> Self {
        TransferKey {
            address: address.to_string(),
            identification: identification.to_string(),
        }
    }
}

/// What the event loop does once the fetched file is in `temp/`.
#[derive(Debug, Clone)]
pub enum Pending {
    /// Apply the update the fetch belongs to.
    Update(UpdateMessage),
    /// Diff the fetched model dump against local state.
    Model { bootstrap: bool },
    /// First-contact fetch of the fleet's auth record.
    Auth,
    /// Sealed model dump fetched back from a blind store.
    Probe,
}

#[derive(Debug)]
struct Inbound {
    last_update: Instant,
    pending: Pending,
}

/// Whether the caller must (re)transmit the request for this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Send,
    InFlight,
}

pub struct Transfers {
    layout: Layout,
    inbound: HashMap<TransferKey, Inbound>,
    outbound: HashSet<TransferKey>,
}

impl Transfers {
    pub fn new(layout: Layout) -> Self {
        Transfers {
            layout,
            inbound: HashMap::new(),
            outbound: HashSet::new(),
        }
    }

    /// Register interest in a fetch. A live record makes this a no-op; an
    /// expired one is refreshed and the request goes out again.
    pub fn request(&mut self, key: TransferKey, pending: Pending) -> RequestAction {
        match self.inbound.get_mut(&key) {
            Some(record) if record.last_update.elapsed() < TRANSFER_TIMEOUT => {
                RequestAction::InFlight
            }
            Some(record) => {
                record.last_update = Instant::now();
                record.pending = pending;
                RequestAction::Send
            }
            None => {
                self.inbound.insert(
                    key,
                    Inbound {
                        last_update: Instant::now(),
                        pending,
                    },
                );
                RequestAction::Send
            }
        }
    }

    /// Authorize an incoming file offer: a matching live record must exist.
    /// The key already binds the offering peer, so a different peer offering
    /// the same identification fails the lookup.
    pub fn authorize(&self, key: &TransferKey) -> bool {
        self.inbound
            .get(key)
            .is_some_and(|record| record.last_update.elapsed() < TRANSFER_TIMEOUT)
    }

    /// The receive finished: move the bytes into `temp/<identification>` and
    /// hand back the pending action. Unknown keys yield `None`.
    pub fn complete(&mut self, key: &TransferKey) -> Result<Option<Pending>> {
        let Some(record) = self.inbound.remove(key) else {
            return Ok(None);
        };
        let from = self.layout.receiving_file(&key.address, &key.identification);
        let to = self.layout.temp_file(&key.identification);
        fs::rename(&from, &to)?;
        Ok(Some(record.pending))
    }

    /// The sender gave up; drop the record and any partial bytes.
    pub fn cancel(&mut self, key: &TransferKey) {
        self.inbound.remove(key);
        let _ = fs::remove_file(self.layout.receiving_file(&key.address, &key.identification));
    }

    /// A newer update for the object arrived mid-flight. Drops the record
    /// and both the partial and temp files. Returns whether a fetch was
    /// actually in flight.
    pub fn supersede(&mut self, key: &TransferKey) -> bool {
        let had = self.inbound.remove(key).is_some();
        if had {
            let _ = fs::remove_file(self.layout.receiving_file(&key.address, &key.identification));
            let _ = fs::remove_file(self.layout.temp_file(&key.identification));
        }
        had
    }

    /// Claim the outbound slot for a key.
    pub fn begin_send(&mut self, key: TransferKey) -> Result<()> {
        if !self.outbound.insert(key.clone()) {
            return Err(Error::AlreadyInProgress {
                address: key.address,
                identification: key.identification,
            });
        }
        Ok(())
    }

    /// Always called when a send finishes, success or not.
    pub fn finish_send(&mut self, key: &TransferKey) {
        self.outbound.remove(key);
    }

    /// `(inbound, outbound)` counts for progress logging.
    pub fn active(&self) -> (usize, usize) {
        (self.inbound.len(), self.outbound.len())
    }

    #[cfg(test)]
    fn backdate(&mut self, key: &TransferKey, by: Duration) {
        if let Some(record) = self.inbound.get_mut(key) {
            record.last_update -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Transfers) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.create().unwrap();
        (dir, Transfers::new(layout))
    }

    fn key() -> TransferKey {
        TransferKey::new("peer-a", "0011223344556677")
    }

    #[test]
    fn duplicate_request_within_timeout_is_noop() {
        let (_guard, mut transfers) = fixture();
        assert_eq!(
            transfers.request(key(), Pending::Auth),
            RequestAction::Send
        );
        assert_eq!(
            transfers.request(key(), Pending::Auth),
            RequestAction::InFlight
        );
        assert_eq!(transfers.active(), (1, 0));
    }

    #[test]
    fn expired_request_retransmits_without_accumulating() {
        let (_guard, mut transfers) = fixture();
        transfers.request(key(), Pending::Auth);
        transfers.backdate(&key(), TRANSFER_TIMEOUT + Duration::from_millis(1));
        assert_eq!(
            transfers.request(key(), Pending::Auth),
            RequestAction::Send
        );
        // Expire again: still exactly one record.
        transfers.backdate(&key(), TRANSFER_TIMEOUT + Duration::from_millis(1));
        assert_eq!(
            transfers.request(key(), Pending::Auth),
            RequestAction::Send
        );
        assert_eq!(transfers.active(), (1, 0));
    }

    #[test]
    fn authorize_requires_live_matching_record() {
        let (_guard, mut transfers) = fixture();
        assert!(!transfers.authorize(&key()));
        transfers.request(key(), Pending::Auth);
        assert!(transfers.authorize(&key()));
        // Same identification from a different peer is a different key.
        assert!(!transfers.authorize(&TransferKey::new("peer-b", "0011223344556677")));
        transfers.backdate(&key(), TRANSFER_TIMEOUT + Duration::from_millis(1));
        assert!(!transfers.authorize(&key()));
    }

    #[test]
    fn complete_moves_bytes_to_temp() {
        let (_guard, mut transfers) = fixture();
        let key = key();
        transfers.request(key.clone(), Pending::Auth);
        let receiving = transfers
            .layout
            .receiving_file(&key.address, &key.identification);
        fs::write(&receiving, b"payload").unwrap();

        let pending = transfers.complete(&key).unwrap();
        assert!(matches!(pending, Some(Pending::Auth)));
        assert!(!receiving.exists());
        let temp = transfers.layout.temp_file(&key.identification);
        assert_eq!(fs::read(temp).unwrap(), b"payload");
        assert_eq!(transfers.active(), (0, 0));
    }

    #[test]
    fn supersede_discards_partial_and_temp_files() {
        let (_guard, mut transfers) = fixture();
        let key = key();
        transfers.request(key.clone(), Pending::Auth);
        let receiving = transfers
            .layout
            .receiving_file(&key.address, &key.identification);
        fs::write(&receiving, b"old half").unwrap();

        assert!(transfers.supersede(&key));
        assert!(!receiving.exists());
        assert!(!transfers.supersede(&key));
    }

    #[test]
    fn outbound_slot_is_exclusive_until_finished() {
        let (_guard, mut transfers) = fixture();
        transfers.begin_send(key()).unwrap();
        assert!(matches!(
            transfers.begin_send(key()),
            Err(Error::AlreadyInProgress { .. })
        ));
        transfers.finish_send(&key());
        transfers.begin_send(key()).unwrap();
    }
}
