//! Trusted-side protocol for encrypted (blind-store) peers.
//!
//! The store accepts one writer at a time: we take its advisory lock, probe
//! its model, then push whatever it lacks as sealed payloads. Each push is
//! announced with a `Push` message; the store answers with a `Request` and
//! we stream the staged ciphertext from `sending/`. When the queue drains
//! the lock is released. Stale identifications on the store are retired via
//! `Notify{Removed}`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::Sealer;
use crate::error::Result;
use crate::ids::MODEL_IDENTIFICATION;
use crate::messages::{
    LockAction, LockMessage, Message, NotifyKind, NotifyMessage, ObjectType, PushMessage,
};
use crate::transfer::{Pending, TransferKey};
use crate::transport::Transport;
use crate::version::VersionVector;

use super::{Internal, SyncEngine};

/// Where a blind-store session currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreState {
    #[default]
    Idle,
    /// `Lock{Request}` sent, waiting for `Lock{Accept}`.
    Locking,
    /// Lock held, waiting for the store's model (or `Notify{Missing}`).
    Probing,
    /// Uploading the queue.
    Pushing,
}

/// One staged upload.
#[derive(Debug, Clone)]
pub struct PushItem {
    pub identification: String,
    pub object_type: ObjectType,
}

#[derive(Debug, Default)]
pub struct Session {
    pub state: StoreState,
    queue: VecDeque<PushItem>,
    in_flight: Option<PushItem>,
}

enum SealSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

fn seal_to(sealer: &Sealer, source: SealSource, staged: &Path) -> Result<()> {
    let plain = match source {
        SealSource::Bytes(bytes) => bytes,
        SealSource::File(path) => fs::read(path)?,
    };
    fs::write(staged, sealer.seal(&plain)?)?;
    Ok(())
}

impl<T: Transport> SyncEngine<T> {
    /// Kick off a session against every online store when local state has
    /// moved since the last completed upload.
    pub(super) async fn blind_store_sync(&mut self) {
        if !self.dirty {
            return;
        }
        let stores: Vec<String> = self
            .registry
            .iter()
            .filter(|p| !p.trusted && self.transport.is_online(&p.address))
            .map(|p| p.address.clone())
            .collect();
        for address in stores {
            let idle = self.encrypted.entry(address.clone()).or_default().state
                == StoreState::Idle;
            if !idle {
                continue;
            }
            tracing::debug!(%address, "requesting blind-store lock");
            let msg = Message::Lock(LockMessage {
                action: LockAction::Request,
            });
            if self.transport.send_message(&address, &msg).await.is_ok() {
                if let Some(session) = self.encrypted.get_mut(&address) {
                    session.state = StoreState::Locking;
                }
            }
        }
    }

    pub(super) async fn on_lock(&mut self, address: &str, msg: LockMessage) {
        match msg.action {
            LockAction::Accept => {
                let probing = {
                    let session = self.encrypted.entry(address.to_string()).or_default();
                    if session.state == StoreState::Locking {
                        session.state = StoreState::Probing;
                        true
                    } else {
                        false
                    }
                };
                if let Some(peer) = self.registry.get_mut(address) {
                    peer.locked = true;
                }
                if probing {
                    tracing::debug!(%address, "lock granted, probing store model");
                    self.request_fetch(
                        address,
                        MODEL_IDENTIFICATION,
                        ObjectType::Model,
                        Pending::Probe,
                    )
                    .await;
                }
            }
            LockAction::Release => {
                tracing::debug!(%address, "store reports lock released");
                if let Some(peer) = self.registry.get_mut(address) {
                    peer.locked = false;
                }
            }
            LockAction::Request => {
                tracing::warn!(%address, "lock request from a store, dropping");
            }
        }
    }

    pub(super) async fn on_notify_from_store(&mut self, address: &str, msg: NotifyMessage) {
        match msg.kind {
            NotifyKind::Missing => {
                let probing = self
                    .encrypted
                    .get(address)
                    .map(|s| s.state == StoreState::Probing)
                    .unwrap_or(false);
                if probing && msg.identification == MODEL_IDENTIFICATION {
                    self.transfers
                        .cancel(&TransferKey::new(address, MODEL_IDENTIFICATION));
                    tracing::info!(%address, "store is empty, uploading full state");
                    self.start_push(address, None).await;
                } else {
                    tracing::debug!(%address, id = %msg.identification, "store reports missing object");
                }
            }
            NotifyKind::Removed => {
                tracing::debug!(%address, id = %msg.identification, "store confirmed removal");
            }
        }
    }

    /// The store's sealed model dump arrived; diff it to keep the upload
    /// minimal. A dump we cannot open means a store state we no longer
    /// understand: overwrite everything.
    pub(super) async fn on_probe_received(&mut self, address: &str) {
        let temp = self.layout.temp_file(MODEL_IDENTIFICATION);
        let opened: Result<crate::object::ObjectInfo> = (|| {
            let sealed = fs::read(&temp)?;
            let auth = self
                .auth
                .as_ref()
                .ok_or_else(|| crate::error::Error::transport("auth record not yet available"))?;
            let plain = auth.open_payload(&sealed)?;
            Ok(serde_json::from_slice(&plain)?)
        })();
        let _ = fs::remove_file(&temp);

        match opened {
            Ok(tree) => {
                let mut known: HashMap<String, VersionVector> = HashMap::new();
                for object in tree.flatten() {
                    if object.identification != MODEL_IDENTIFICATION {
                        known.insert(object.identification.clone(), object.version.clone());
                    }
                }
                self.start_push(address, Some(known)).await;
            }
            Err(err) => {
                tracing::warn!(%address, "cannot open store model, uploading full state: {err}");
                self.start_push(address, None).await;
            }
        }
    }

    /// Build the upload queue. `known` maps the store's identifications to
    /// the versions it holds; `None` means the store is empty.
    async fn start_push(&mut self, address: &str, known: Option<HashMap<String, VersionVector>>) {
        let mut items = Vec::new();
        for object in self.model.non_directory_objects() {
            let wanted = match &known {
                None => true,
                Some(map) => map
                    .get(&object.identification)
                    .is_none_or(|held| !held.includes(&object.version)),
            };
            if wanted {
                items.push(PushItem {
                    identification: object.identification,
                    object_type: ObjectType::Object,
                });
            }
        }
        // The dump goes last so the store's tree never references payloads
        // it does not have yet.
        items.push(PushItem {
            identification: MODEL_IDENTIFICATION.to_string(),
            object_type: ObjectType::Model,
        });

        // Retire what the store holds but the fleet no longer does.
        if let Some(map) = &known {
            for identification in map.keys() {
                if self.model.get_info_from(identification).is_err() {
                    self.send_notify(address, NotifyKind::Removed, identification)
                        .await;
                }
            }
        }
        for identification in self.model.removals().all().unwrap_or_default() {
            self.send_notify(address, NotifyKind::Removed, &identification)
                .await;
        }

        tracing::info!(%address, items = items.len(), "starting blind-store upload");
        let session = self.encrypted.entry(address.to_string()).or_default();
        session.state = StoreState::Pushing;
        session.queue = items.into();
        session.in_flight = None;
        self.advance_store(address).await;
    }

    /// Move the session forward: seal the next queued item off-thread, or
    /// release the lock when the queue is dry.
    pub(super) async fn advance_store(&mut self, address: &str) {
        loop {
            let item = {
                let Some(session) = self.encrypted.get_mut(address) else {
                    return;
                };
                if session.in_flight.is_some() {
                    return;
                }
                session.queue.pop_front()
            };
            let Some(item) = item else {
                self.release_store(address).await;
                return;
            };

            let source = match item.object_type {
                ObjectType::Model => match serde_json::to_vec_pretty(&self.model.read()) {
                    Ok(bytes) => SealSource::Bytes(bytes),
                    Err(err) => {
                        tracing::error!("model dump serialization failed: {err}");
                        continue;
                    }
                },
                _ => match self.model.get_info_from(&item.identification) {
                    Ok(object) if !object.directory => {
                        SealSource::File(self.layout.absolute(&object.path))
                    }
                    _ => {
                        tracing::debug!(id = %item.identification, "object vanished before upload");
                        continue;
                    }
                },
            };
            let Some(auth) = &self.auth else { return };
            let sealer = auth.sealer();
            if let Some(session) = self.encrypted.get_mut(address) {
                session.in_flight = Some(item.clone());
            }

            // The expensive seal runs on a worker thread with no engine
            // state in hand; only the completion comes back to the loop.
            let staged = self.layout.sending_file(&item.identification);
            let internal = self.internal_tx.clone();
            let address = address.to_string();
            tokio::task::spawn_blocking(move || {
                let ok = match seal_to(&sealer, source, &staged) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(id = %item.identification, "sealing payload failed: {err}");
                        false
                    }
                };
                let _ = internal.blocking_send(Internal::Sealed { address, item, ok });
            });
            return;
        }
    }

    pub(super) async fn on_item_sealed(&mut self, address: &str, item: PushItem, ok: bool) {
        if !ok {
            if let Some(session) = self.encrypted.get_mut(address) {
                session.in_flight = None;
            }
            self.advance_store(address).await;
            return;
        }
        let msg = Message::Push(PushMessage {
            identification: item.identification.clone(),
            object_type: item.object_type,
        });
        if let Err(err) = self.transport.send_message(address, &msg).await {
            tracing::debug!(%address, "push announcement failed, store offline? {err}");
            if let Some(session) = self.encrypted.get_mut(address) {
                session.in_flight = None;
                session.state = StoreState::Idle;
            }
        }
        // Otherwise: wait for the store's Request naming this payload.
    }

    /// The staged payload finished streaming to the store.
    pub(super) async fn on_store_item_sent(&mut self, address: &str, identification: &str, ok: bool) {
        let advance = {
            let Some(session) = self.encrypted.get_mut(address) else {
                return;
            };
            match &session.in_flight {
                Some(item) if item.identification == identification => {
                    session.in_flight = None;
                    true
                }
                _ => false,
            }
        };
        if !ok {
            tracing::debug!(%address, %identification, "store upload failed, retrying on next cycle");
        }
        if advance {
            self.advance_store(address).await;
        }
    }

    async fn release_store(&mut self, address: &str) {
        if let Some(session) = self.encrypted.get_mut(address) {
            session.state = StoreState::Idle;
        }
        if let Some(peer) = self.registry.get_mut(address) {
            peer.locked = false;
        }
        let msg = Message::Lock(LockMessage {
            action: LockAction::Release,
        });
        if let Err(err) = self.transport.send_message(address, &msg).await {
            tracing::debug!(%address, "lock release failed: {err}");
        }
        self.dirty = false;
        tracing::info!(%address, "blind-store sync complete, lock released");
    }
}
