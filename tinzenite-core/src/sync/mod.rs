//! The synchronization engine.
//!
//! One background task owns every piece of mutable state: the model, the
//! peer registry, the transfer tables, and the per-peer session state.
//! Transport callbacks, model events, internal completions, and periodic
//! ticks all arrive over channels and are handled strictly one at a time, so
//! nothing here needs a lock.
//!
//! Protocol trouble never escapes the loop; handlers log and move on. Only
//! unrecoverable disk or configuration errors propagate out of `run`.

mod encrypted;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::auth::{AuthRecord, Authenticator};
use crate::error::{Error, Result};
use crate::ids::{AUTH_IDENTIFICATION, MODEL_IDENTIFICATION, new_identification};
use crate::merge;
use crate::messages::{
    Message, NotifyKind, NotifyMessage, ObjectType, PushMessage, RequestMessage, UpdateMessage,
};
use crate::model::{ApplyResult, Model};
use crate::object::{Operation, UpdateEvent};
use crate::paths::Layout;
use crate::peers::{Peer, PeerRegistry, SelfRecord};
use crate::transfer::{Pending, RequestAction, TransferKey, Transfers};
use crate::transport::{FileDecision, Transport, TransportEvent, TransportEvents};

pub use encrypted::Session as EncryptedSession;

/// Peer registry reconciliation and challenge cadence.
pub const PEER_TICK: Duration = Duration::from_secs(10);
/// Transfer progress logging cadence.
pub const PROGRESS_TICK: Duration = Duration::from_secs(5);

/// Sized for a full scan's worth of events; the loop drains it after every
/// model operation.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Decides whether an address asking to join (and whether it asks for
/// trust) is let in.
pub type PeerValidator = Box<dyn Fn(&str, bool) -> bool + Send + Sync>;

/// Session phase of a connected trusted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connected,
    Authenticating,
    Syncing,
    Idle,
}

pub struct EngineOptions {
    pub root: PathBuf,
    pub peer_name: String,
    pub password: String,
    pub scan_interval: Duration,
    pub validator: PeerValidator,
}

#[derive(Debug)]
pub enum Command {
    Scan,
    Close(oneshot::Sender<()>),
}

/// Cheap handle for steering a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Ask the engine for an immediate rescan.
    pub async fn scan(&self) -> Result<()> {
        self.commands
            .send(Command::Scan)
            .await
            .map_err(|_| Error::transport("engine stopped"))
    }

    /// Stop the engine: drains the loop, flushes persistent state, tears
    /// down the transport. Resolves once everything is down.
    pub async fn close(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Close(ack))
            .await
            .map_err(|_| Error::transport("engine stopped"))?;
        done.await.map_err(|_| Error::transport("engine stopped"))
    }
}

/// Completions posted back to the loop by spawned work.
#[derive(Debug)]
enum Internal {
    SendDone { key: TransferKey, ok: bool },
    Sealed { address: String, item: encrypted::PushItem, ok: bool },
}

pub struct SyncEngine<T: Transport> {
    layout: Layout,
    model: Model,
    auth: Option<Authenticator>,
    password: String,
    self_peer: Peer,
    registry: PeerRegistry,
    transfers: Transfers,
    transport: Arc<T>,
    /// Session-level authentication, keyed by address. Valid even before the
    /// peer's record has replicated to us.
    authenticated: HashSet<String>,
    phases: HashMap<String, Phase>,
    /// Outstanding challenge counters by address; superseded on each tick.
    challenges: HashMap<String, u64>,
    encrypted: HashMap<String, encrypted::Session>,
    /// Addresses awaiting their first model exchange.
    boot: Vec<String>,
    /// Local changes not yet pushed to blind stores.
    dirty: bool,
    events_rx: mpsc::Receiver<UpdateEvent>,
    transport_rx: TransportEvents,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    commands_rx: mpsc::Receiver<Command>,
    validator: PeerValidator,
    scan_interval: Duration,
}

impl<T: Transport> SyncEngine<T> {
    /// Provision a fresh directory: new identity, new auth record, empty
    /// model.
    pub fn create(
        options: EngineOptions,
        user: &str,
        dirname: &str,
        transport: Arc<T>,
        transport_rx: TransportEvents,
    ) -> Result<(Self, EngineHandle)> {
        let layout = Layout::new(&options.root);
        layout.create()?;
        let auth = Authenticator::create(dirname, user, &options.password)?;
        auth.store(&layout.auth_file())?;
        let self_peer = Peer::new(
            &options.peer_name,
            &transport.address(),
            &new_identification(),
            true,
        );
        self_peer.store(&layout.peers_dir())?;
        SelfRecord {
            peer: self_peer.clone(),
            transport: transport.save_blob(),
        }
        .store(&layout.self_file())?;
        Self::finish(
            options,
            layout,
            Some(auth),
            self_peer,
            Vec::new(),
            transport,
            transport_rx,
        )
    }

    /// Resume an existing directory.
    pub fn load(
        options: EngineOptions,
        transport: Arc<T>,
        transport_rx: TransportEvents,
    ) -> Result<(Self, EngineHandle)> {
        let layout = Layout::new(&options.root);
        layout.create()?;
        let auth = Authenticator::load(&layout.auth_file(), &options.password)?;
        let record = SelfRecord::load(&layout.self_file())?;
        let boot = load_boot(&layout)?;
        Self::finish(
            options,
            layout,
            Some(auth),
            record.peer,
            boot,
            transport,
            transport_rx,
        )
    }

    /// Join an existing fleet through a bootstrap address. The auth record
    /// is fetched from the fleet and opened with our password.
    pub fn join(
        options: EngineOptions,
        remote: &str,
        transport: Arc<T>,
        transport_rx: TransportEvents,
    ) -> Result<(Self, EngineHandle)> {
        let layout = Layout::new(&options.root);
        layout.create()?;
        let self_peer = Peer::new(
            &options.peer_name,
            &transport.address(),
            &new_identification(),
            true,
        );
        SelfRecord {
            peer: self_peer.clone(),
            transport: transport.save_blob(),
        }
        .store(&layout.self_file())?;
        let boot = vec![remote.to_string()];
        save_boot(&layout, &boot)?;
        Self::finish(options, layout, None, self_peer, boot, transport, transport_rx)
    }

    fn finish(
        options: EngineOptions,
        layout: Layout,
        auth: Option<Authenticator>,
        self_peer: Peer,
        boot: Vec<String>,
        transport: Arc<T>,
        transport_rx: TransportEvents,
    ) -> Result<(Self, EngineHandle)> {
        layout.clear_transient()?;
        let mut model = Model::new(layout.clone(), &self_peer.identification)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        model.register(events_tx);
        let registry = PeerRegistry::load(&layout.peers_dir())?;
        let transfers = Transfers::new(layout.clone());
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let engine = SyncEngine {
            layout,
            model,
            auth,
            password: options.password,
            self_peer,
            registry,
            transfers,
            transport,
            authenticated: HashSet::new(),
            phases: HashMap::new(),
            challenges: HashMap::new(),
            encrypted: HashMap::new(),
            boot,
            dirty: true,
            events_rx,
            transport_rx,
            internal_tx,
            internal_rx,
            commands_rx,
            validator: options.validator,
            scan_interval: options.scan_interval,
        };
        Ok((engine, EngineHandle { commands: commands_tx }))
    }

    pub fn address(&self) -> String {
        self.self_peer.address.clone()
    }

    pub fn peer_identification(&self) -> &str {
        &self.self_peer.identification
    }

    /// The event loop. Runs until `close` is requested.
    pub async fn run(mut self) -> Result<()> {
        let mut peer_tick = tokio::time::interval(PEER_TICK);
        let mut progress_tick = tokio::time::interval(PROGRESS_TICK);
        let mut scan_tick = tokio::time::interval(self.scan_interval);

        self.connect_known().await;

        loop {
            tokio::select! {
                Some(event) = self.transport_rx.recv() => {
                    if let Err(err) = self.handle_transport(event).await {
                        tracing::error!("transport event failed: {err}");
                    }
                }
                Some(event) = self.events_rx.recv() => self.fan_out(event).await,
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                Some(command) = self.commands_rx.recv() => match command {
                    Command::Scan => self.scan().await,
                    Command::Close(ack) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return Ok(());
                    }
                },
                _ = peer_tick.tick() => self.peer_maintenance().await,
                _ = progress_tick.tick() => self.report_progress(),
                _ = scan_tick.tick() => self.scan().await,
            }
        }
    }

    async fn connect_known(&mut self) {
        let mut addresses: Vec<String> = self
            .registry
            .iter()
            .filter(|p| p.address != self.self_peer.address)
            .map(|p| p.address.clone())
            .collect();
        addresses.extend(self.boot.iter().cloned());
        for address in addresses {
            if let Err(err) = self.transport.connect(&address).await {
                tracing::debug!(%address, "connect attempt failed: {err}");
            }
        }
    }

    async fn scan(&mut self) {
        if let Err(err) = self.model.update().await {
            tracing::error!("scan failed: {err}");
        }
        self.drain_model_events().await;
        self.purge_complete_removals();
        self.blind_store_sync().await;
    }

    async fn drain_model_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.fan_out(event).await;
        }
    }

    /// Propagate a local change to every authenticated, online trusted
    /// peer. Encrypted peers get theirs through the push protocol.
    async fn fan_out(&mut self, event: UpdateEvent) {
        self.dirty = true;
        let msg = Message::Update(UpdateMessage {
            operation: event.operation,
            object: event.object,
        });
        let recipients: Vec<String> = self
            .registry
            .iter()
            .filter(|p| {
                p.trusted
                    && p.address != self.self_peer.address
                    && self.authenticated.contains(&p.address)
                    && self.transport.is_online(&p.address)
            })
            .map(|p| p.address.clone())
            .collect();
        for address in recipients {
            if let Err(err) = self.transport.send_message(&address, &msg).await {
                tracing::debug!(%address, "update fan-out failed, peer will catch up on sync: {err}");
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::FriendRequest {
                address,
                name,
                requests_trust,
            } => {
                // Known peers re-connecting were validated when they joined.
                let known = self.registry.get(&address).is_some();
                if known || (self.validator)(&address, requests_trust) {
                    tracing::info!(%address, %name, requests_trust, known, "accepting peer");
                    self.transport.accept_friend(&address).await?;
                } else {
                    tracing::info!(%address, %name, "peer request denied");
                }
                Ok(())
            }
            TransportEvent::Connected { address } => {
                self.on_connected(address).await;
                Ok(())
            }
            TransportEvent::Message { address, line } => match Message::decode(&line) {
                Ok(msg) => self.dispatch(address, msg).await,
                Err(err) => {
                    tracing::warn!(%address, "dropping undecodable message: {err}");
                    Ok(())
                }
            },
            TransportEvent::AllowFile {
                address,
                identification,
                size,
                decision,
            } => {
                let key = TransferKey::new(&address, &identification);
                let reply = if self.transfers.authorize(&key) {
                    FileDecision::Accept {
                        destination: self.layout.receiving_file(&address, &identification),
                    }
                } else {
                    tracing::warn!(%address, %identification, size, "denying unsolicited file offer");
                    FileDecision::Deny
                };
                let _ = decision.send(reply);
                Ok(())
            }
            TransportEvent::FileReceived {
                address,
                identification,
            } => {
                self.on_file_received(address, identification).await;
                Ok(())
            }
            TransportEvent::FileCanceled {
                address,
                identification,
            } => {
                self.transfers
                    .cancel(&TransferKey::new(&address, &identification));
                Ok(())
            }
        }
    }

    async fn on_connected(&mut self, address: String) {
        tracing::info!(%address, "peer connected");
        self.authenticated.remove(&address);
        self.challenges.remove(&address);
        if let Some(peer) = self.registry.get_mut(&address) {
            peer.reset_runtime();
        }
        self.phases.insert(address.clone(), Phase::Connected);
        if self.boot.contains(&address) && self.auth.is_none() {
            // First contact: fetch the fleet's auth record before anything
            // else, it is the key to the door.
            self.request_fetch(&address, AUTH_IDENTIFICATION, ObjectType::Auth, Pending::Auth)
                .await;
        }
    }

    /// Ask a peer for a file unless an equivalent fetch is already live.
    async fn request_fetch(
        &mut self,
        address: &str,
        identification: &str,
        object_type: ObjectType,
        pending: Pending,
    ) {
        let key = TransferKey::new(address, identification);
        if self.transfers.request(key, pending) == RequestAction::Send {
            let msg = Message::Request(RequestMessage {
                object_type,
                identification: identification.to_string(),
            });
            if let Err(err) = self.transport.send_message(address, &msg).await {
                tracing::debug!(%address, %identification, "request send failed: {err}");
            }
        }
    }

    async fn dispatch(&mut self, address: String, msg: Message) -> Result<()> {
        let peer = self.registry.get(&address);
        let is_encrypted = peer.map(|p| !p.trusted).unwrap_or(false);

        if is_encrypted {
            // Blind stores speak a restricted dialect and skip
            // authentication entirely.
            return match msg {
                Message::Lock(m) => {
                    self.on_lock(&address, m).await;
                    Ok(())
                }
                Message::Notify(m) => {
                    self.on_notify_from_store(&address, m).await;
                    Ok(())
                }
                Message::Request(m) => self.on_request(address, m).await,
                Message::Push(m) => {
                    self.on_push(&address, m).await;
                    Ok(())
                }
                other => {
                    tracing::debug!(%address, kind = other.kind(), "dropping message from encrypted peer");
                    Ok(())
                }
            };
        }

        if !self.authenticated.contains(&address) {
            // The single exception to the authentication gate: the fleet's
            // auth record may be requested by a joining peer. The record is
            // sealed under the fleet password, so serving it reveals nothing
            // to an outsider.
            return match msg {
                Message::Authentication(m) => {
                    self.on_authentication(&address, m).await;
                    Ok(())
                }
                Message::Request(ref m) if m.object_type == ObjectType::Auth => {
                    self.on_request(address, m.clone()).await
                }
                other => {
                    tracing::debug!(%address, kind = other.kind(), "dropping message from unauthenticated peer");
                    Ok(())
                }
            };
        }

        match msg {
            Message::Update(m) => {
                self.on_update(address, m).await;
                Ok(())
            }
            Message::Request(m) => self.on_request(address, m).await,
            Message::Notify(m) => {
                self.on_notify(&address, m).await;
                Ok(())
            }
            Message::Authentication(m) => {
                self.on_authentication(&address, m).await;
                Ok(())
            }
            other => {
                tracing::warn!(%address, kind = other.kind(), "illegal message from trusted peer");
                Ok(())
            }
        }
    }

    async fn on_authentication(&mut self, address: &str, msg: crate::messages::AuthenticationMessage) {
        enum Verdict {
            /// The valid reply to our outstanding challenge.
            ReplyVerified,
            /// An inbound challenge we can answer; valid ciphertext proves
            /// the directory key, so answering also authenticates the
            /// sender to us.
            Answer(crate::messages::AuthenticationMessage),
            /// Already authenticated and not a reply; nothing to do.
            Surplus,
            /// The envelope did not open.
            Reject,
        }

        let verdict = {
            let Some(auth) = &self.auth else {
                tracing::debug!(%address, "no auth record yet, ignoring challenge");
                return;
            };
            let expected = self.challenges.get(address).copied();
            if expected.is_some_and(|expected| auth.verify_reply(expected, &msg)) {
                Verdict::ReplyVerified
            } else if self.authenticated.contains(address) {
                Verdict::Surplus
            } else {
                match auth.answer_challenge(&msg) {
                    Ok(reply) => Verdict::Answer(reply),
                    Err(_) => Verdict::Reject,
                }
            }
        };

        match verdict {
            Verdict::ReplyVerified => {
                self.challenges.remove(address);
                self.mark_authenticated(address).await;
            }
            Verdict::Answer(reply) => {
                if let Err(err) = self
                    .transport
                    .send_message(address, &Message::Authentication(reply))
                    .await
                {
                    tracing::debug!(%address, "challenge answer send failed: {err}");
                    return;
                }
                self.mark_authenticated(address).await;
            }
            Verdict::Surplus => {
                tracing::debug!(%address, "ignoring surplus authentication message");
            }
            Verdict::Reject => {
                tracing::warn!(%address, "authentication envelope failed to open, dropping");
            }
        }
    }

    async fn mark_authenticated(&mut self, address: &str) {
        if self.authenticated.insert(address.to_string()) {
            tracing::info!(%address, "peer authenticated");
        }
        if let Some(peer) = self.registry.get_mut(address) {
            peer.authenticated = true;
        }
        self.phases.insert(address.to_string(), Phase::Syncing);
        // Model exchange: diff their tree against ours.
        let bootstrap = self.boot.contains(&address.to_string());
        self.request_fetch(
            address,
            MODEL_IDENTIFICATION,
            ObjectType::Model,
            Pending::Model { bootstrap },
        )
        .await;
    }

    async fn on_update(&mut self, address: String, msg: UpdateMessage) {
        let sender = self.sender_identification(&address);
        if msg.operation == Operation::Remove || msg.object.directory || msg.object.shadow {
            // Nothing to fetch; reconcile immediately.
            self.apply_now(&address, &msg, &sender).await;
            return;
        }
        // A newer update supersedes any in-flight fetch of the same object.
        let key = TransferKey::new(&address, &msg.object.identification);
        if self.transfers.supersede(&key) {
            self.transport
                .cancel_file(&address, &msg.object.identification)
                .await;
        }
        let identification = msg.object.identification.clone();
        self.request_fetch(
            &address,
            &identification,
            ObjectType::Object,
            Pending::Update(msg),
        )
        .await;
    }

    /// Run a message through the model and react to the outcome.
    async fn apply_now(&mut self, address: &str, msg: &UpdateMessage, sender: &str) {
        match self.model.apply_update(msg, sender) {
            Ok(ApplyResult::Applied) => {
                tracing::debug!(path = %msg.object.path, op = ?msg.operation, "applied remote update");
                if msg.operation == Operation::Remove {
                    self.send_notify(address, NotifyKind::Removed, &msg.object.identification)
                        .await;
                }
            }
            Ok(ApplyResult::IgnoreUpdate) => {
                // Stale; drop any fetched temp file.
                let _ = fs::remove_file(self.layout.temp_file(&msg.object.identification));
            }
            Ok(ApplyResult::ObjectRemovalDone) => {
                self.send_notify(address, NotifyKind::Removed, &msg.object.identification)
                    .await;
            }
            Ok(ApplyResult::Conflict) => {
                if let Err(err) = merge::resolve(&mut self.model, &self.layout, msg, sender).await {
                    tracing::error!(path = %msg.object.path, "merge failed: {err}");
                }
                self.drain_model_events().await;
            }
            Err(err) => {
                // Apply abandoned; the temp file stays for a retry.
                tracing::error!(path = %msg.object.path, "apply failed: {err}");
            }
        }
    }

    async fn send_notify(&self, address: &str, kind: NotifyKind, identification: &str) {
        let msg = Message::Notify(NotifyMessage {
            kind,
            identification: identification.to_string(),
        });
        if let Err(err) = self.transport.send_message(address, &msg).await {
            tracing::debug!(%address, "notify send failed: {err}");
        }
    }

    async fn on_request(&mut self, address: String, msg: RequestMessage) -> Result<()> {
        let is_encrypted = self
            .registry
            .get(&address)
            .map(|p| !p.trusted)
            .unwrap_or(false);

        // Blind stores ask for what we announced via Push: the staged,
        // sealed payload.
        let serve: Option<(PathBuf, bool)> = if is_encrypted {
            let staged = self.layout.sending_file(&msg.identification);
            if staged.exists() {
                Some((staged, true))
            } else {
                tracing::warn!(%address, id = %msg.identification, "encrypted peer asked for unstaged payload");
                None
            }
        } else {
            match msg.object_type {
                ObjectType::Object => match self.model.get_info_from(&msg.identification) {
                    Ok(object) if !object.directory => {
                        Some((self.layout.absolute(&object.path), false))
                    }
                    Ok(_) => {
                        tracing::debug!(id = %msg.identification, "directories are never transferred");
                        None
                    }
                    Err(_) => {
                        self.send_notify(&address, NotifyKind::Missing, &msg.identification)
                            .await;
                        None
                    }
                },
                ObjectType::Model => {
                    if !self.boot.is_empty() {
                        // Mid-bootstrap our identifications are still in flux;
                        // serving the dump now would seed duplicates.
                        self.send_notify(&address, NotifyKind::Missing, &msg.identification)
                            .await;
                        None
                    } else {
                        // Staged per requester so concurrent exchanges don't
                        // trample each other.
                        let staged = self
                            .layout
                            .sending_file(&format!("{address}.{MODEL_IDENTIFICATION}"));
                        fs::write(&staged, serde_json::to_vec_pretty(&self.model.read())?)?;
                        Some((staged, true))
                    }
                }
                ObjectType::Auth => {
                    let path = self.layout.auth_file();
                    if path.exists() {
                        Some((path, false))
                    } else {
                        self.send_notify(&address, NotifyKind::Missing, &msg.identification)
                            .await;
                        None
                    }
                }
                ObjectType::Peer => {
                    let path = self
                        .layout
                        .peers_dir()
                        .join(format!("{}.json", msg.identification));
                    if path.exists() {
                        Some((path, false))
                    } else {
                        self.send_notify(&address, NotifyKind::Missing, &msg.identification)
                            .await;
                        None
                    }
                }
            }
        };

        let Some((path, cleanup)) = serve else {
            return Ok(());
        };
        let key = TransferKey::new(&address, &msg.identification);
        if let Err(err) = self.transfers.begin_send(key.clone()) {
            tracing::debug!(%address, id = %msg.identification, "{err}");
            return Ok(());
        }
        // The actual transfer runs on its own task; only the completion
        // crosses back into the loop.
        let transport = Arc::clone(&self.transport);
        let internal = self.internal_tx.clone();
        let identification = msg.identification.clone();
        tokio::spawn(async move {
            let ok = transport
                .send_file(&key.address, &identification, &path)
                .await
                .is_ok();
            if !ok {
                tracing::debug!(address = %key.address, %identification, "file send failed");
            }
            if cleanup {
                let _ = fs::remove_file(&path);
            }
            let _ = internal.send(Internal::SendDone { key, ok }).await;
        });
        Ok(())
    }

    async fn on_notify(&mut self, address: &str, msg: NotifyMessage) {
        match msg.kind {
            NotifyKind::Removed => {
                let sender = self.sender_identification(address);
                match self
                    .model
                    .removals()
                    .acknowledge(&msg.identification, &sender)
                {
                    Ok(true) => {
                        tracing::debug!(id = %msg.identification, %address, "removal acknowledged")
                    }
                    Ok(false) => {}
                    Err(err) => tracing::warn!("removal acknowledgement failed: {err}"),
                }
            }
            NotifyKind::Missing => {
                tracing::debug!(%address, id = %msg.identification, "peer reports object missing");
            }
        }
    }

    async fn on_push(&mut self, address: &str, msg: PushMessage) {
        // We are a trusted peer: nobody uploads to us via the push protocol.
        tracing::warn!(%address, id = %msg.identification, "unexpected push, dropping");
    }

    async fn on_file_received(&mut self, address: String, identification: String) {
        let key = TransferKey::new(&address, &identification);
        let pending = match self.transfers.complete(&key) {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::warn!(%address, %identification, "received file without a transfer record");
                return;
            }
            Err(err) => {
                tracing::error!(%address, %identification, "completing transfer failed: {err}");
                return;
            }
        };
        match pending {
            Pending::Update(msg) => {
                let sender = self.sender_identification(&address);
                self.apply_now(&address, &msg, &sender).await;
            }
            Pending::Model { bootstrap } => {
                if let Err(err) = self.on_model_received(&address, bootstrap).await {
                    tracing::error!(%address, "model exchange failed: {err}");
                }
            }
            Pending::Auth => {
                if let Err(err) = self.on_auth_received(&address).await {
                    tracing::error!(%address, "bootstrap auth fetch failed: {err}");
                }
            }
            Pending::Probe => {
                self.on_probe_received(&address).await;
            }
        }
    }

    async fn on_model_received(&mut self, address: &str, bootstrap: bool) -> Result<()> {
        let temp = self.layout.temp_file(MODEL_IDENTIFICATION);
        let tree: crate::object::ObjectInfo = serde_json::from_str(&fs::read_to_string(&temp)?)?;
        let _ = fs::remove_file(&temp);

        let messages = if bootstrap {
            tracing::info!(%address, "bootstrapping against foreign model");
            let messages = self.model.bootstrap(&tree)?;
            self.drain_model_events().await;
            self.boot.retain(|a| a.as_str() != address);
            save_boot(&self.layout, &self.boot)?;
            messages
        } else {
            self.model.sync(&tree)
        };

        tracing::info!(%address, pending = messages.len(), "model exchange diffed");
        if messages.is_empty() {
            self.phases.insert(address.to_string(), Phase::Idle);
        }
        let sender = self.sender_identification(address);
        for msg in messages {
            if msg.operation == Operation::Remove || msg.object.directory || msg.object.shadow {
                self.apply_now(address, &msg, &sender).await;
            } else {
                let identification = msg.object.identification.clone();
                self.request_fetch(
                    address,
                    &identification,
                    ObjectType::Object,
                    Pending::Update(msg),
                )
                .await;
            }
        }
        Ok(())
    }

    /// First contact: the fetched auth record, opened with our password,
    /// makes us a member of the fleet.
    async fn on_auth_received(&mut self, address: &str) -> Result<()> {
        let temp = self.layout.temp_file(AUTH_IDENTIFICATION);
        let record: AuthRecord = serde_json::from_str(&fs::read_to_string(&temp)?)?;
        let auth = Authenticator::from_record(record, &self.password)?;
        auth.store(&self.layout.auth_file())?;
        let _ = fs::remove_file(&temp);
        tracing::info!(dirname = %auth.dirname(), "joined fleet, auth record obtained");
        self.auth = Some(auth);

        // Become visible to the fleet: our record replicates like any other
        // object from here.
        self.self_peer.store(&self.layout.peers_dir())?;
        self.registry.insert(self.self_peer.clone());
        self.model.partial_update(".tinzenite/org").await?;
        self.drain_model_events().await;

        // The periodic tick will now challenge the boot peer and the model
        // exchange follows from authentication.
        self.issue_challenge(address).await;
        Ok(())
    }

    async fn issue_challenge(&mut self, address: &str) {
        let Some(auth) = &self.auth else { return };
        match auth.build_challenge() {
            Ok((expected, msg)) => {
                if self
                    .transport
                    .send_message(address, &Message::Authentication(msg))
                    .await
                    .is_ok()
                {
                    // Supersedes any previous outstanding challenge.
                    self.challenges.insert(address.to_string(), expected);
                    self.phases
                        .insert(address.to_string(), Phase::Authenticating);
                }
            }
            Err(err) => tracing::error!("building challenge failed: {err}"),
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SendDone { key, ok } => {
                self.transfers.finish_send(&key);
                let is_encrypted = self
                    .registry
                    .get(&key.address)
                    .map(|p| !p.trusted)
                    .unwrap_or(false);
                if is_encrypted {
                    self.on_store_item_sent(&key.address, &key.identification, ok)
                        .await;
                }
            }
            Internal::Sealed { address, item, ok } => {
                self.on_item_sealed(&address, item, ok).await;
            }
        }
    }

    async fn peer_maintenance(&mut self) {
        // Pick up peer records that arrived through the model.
        match self.registry.reconcile(&self.layout.peers_dir()) {
            Ok(fresh) => {
                for peer in fresh {
                    tracing::info!(name = %peer.name, address = %peer.address, trusted = peer.trusted, "discovered peer record");
                    if peer.address != self.self_peer.address {
                        if let Err(err) = self.transport.connect(&peer.address).await {
                            tracing::debug!(address = %peer.address, "connect failed: {err}");
                        }
                    }
                }
            }
            Err(err) => tracing::warn!("peer reconciliation failed: {err}"),
        }

        // Session state dies with the connection.
        let offline: Vec<String> = self
            .registry
            .iter()
            .filter(|p| {
                p.address != self.self_peer.address && !self.transport.is_online(&p.address)
            })
            .map(|p| p.address.clone())
            .collect();
        for address in offline {
            if self.authenticated.remove(&address) {
                tracing::info!(%address, "peer went offline");
            }
            self.challenges.remove(&address);
            self.phases.remove(&address);
            self.encrypted.remove(&address);
            if let Some(peer) = self.registry.get_mut(&address) {
                peer.reset_runtime();
            }
        }

        // Challenge whoever is connected but not yet in.
        let targets: Vec<String> = self
            .registry
            .iter()
            .filter(|p| {
                p.trusted
                    && p.address != self.self_peer.address
                    && !self.authenticated.contains(&p.address)
                    && self.transport.is_online(&p.address)
            })
            .map(|p| p.address.clone())
            .collect();
        for address in targets {
            self.issue_challenge(&address).await;
        }

        // Keep the model exchange going until a session reaches Idle; a
        // stale transfer record expires and the request goes out again.
        let syncing: Vec<String> = self
            .phases
            .iter()
            .filter(|(address, phase)| {
                **phase == Phase::Syncing && self.authenticated.contains(*address)
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in syncing {
            self.request_fetch(
                &address,
                MODEL_IDENTIFICATION,
                ObjectType::Model,
                Pending::Model {
                    bootstrap: self.boot.contains(&address),
                },
            )
            .await;
        }

        self.purge_complete_removals();
        self.blind_store_sync().await;
    }

    fn report_progress(&self) {
        let (inbound, outbound) = self.transfers.active();
        if inbound + outbound > 0 {
            tracing::info!(inbound, outbound, "transfers in flight");
        }
    }

    fn purge_complete_removals(&self) {
        let trusted = self.registry.trusted_identifications();
        if trusted.is_empty() {
            return;
        }
        let all = match self.model.removals().all() {
            Ok(all) => all,
            Err(err) => {
                tracing::warn!("listing removal records failed: {err}");
                return;
            }
        };
        for identification in all {
            match self.model.removals().is_complete(&identification, &trusted) {
                Ok(true) => {
                    tracing::debug!(id = %identification, "removal complete, purging record");
                    if let Err(err) = self.model.removals().purge(&identification) {
                        tracing::warn!("purging removal record failed: {err}");
                    }
                }
                Ok(false) => {}
                Err(err) => tracing::warn!("removal completion check failed: {err}"),
            }
        }
    }

    fn sender_identification(&self, address: &str) -> String {
        self.registry
            .get(address)
            .map(|p| p.identification.clone())
            .unwrap_or_else(|| address.to_string())
    }

    async fn shutdown(&mut self) {
        tracing::info!("engine shutting down");
        // Quiesce: absorb whatever is already queued.
        self.drain_model_events().await;
        if let Err(err) = self.model.persist() {
            tracing::error!("final model flush failed: {err}");
        }
        let record = SelfRecord {
            peer: self.self_peer.clone(),
            transport: self.transport.save_blob(),
        };
        if let Err(err) = record.store(&self.layout.self_file()) {
            tracing::error!("self record flush failed: {err}");
        }
        if let Err(err) = save_boot(&self.layout, &self.boot) {
            tracing::error!("boot list flush failed: {err}");
        }
        self.transport.close().await;
    }
}

fn load_boot(layout: &Layout) -> Result<Vec<String>> {
    match fs::read_to_string(layout.boot_file()) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn save_boot(layout: &Layout, boot: &[String]) -> Result<()> {
    fs::write(layout.boot_file(), serde_json::to_string_pretty(boot)?)?;
    Ok(())
}
