//! Iroh-backed overlay transport.
//!
//! Every peer link is one QUIC connection with a single long-lived
//! bidirectional control stream carrying newline-delimited JSON messages.
//! File transfers each get their own bidirectional stream: a one-line JSON
//! header, the raw bytes, then a one-byte acknowledgement on the return
//! half once the receiver has the whole file on disk.
//!
//! The overlay gives us encrypted transport by default, NAT hole-punching
//! with relay fallback, and a public-key identity per endpoint; that
//! endpoint id doubles as the peer address everywhere in the engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use tinzenite_core::error::Error as CoreError;
use tinzenite_core::messages::Message;
use tinzenite_core::transport::{FileDecision, Transport, TransportEvent, TransportEvents};

/// ALPN protocol identifier for sync-over-iroh.
pub const ALPN: &[u8] = b"tinzenite/sync/1";

const EVENT_CAPACITY: usize = 1024;
const LINE_CAPACITY: usize = 256;
/// Lines buffered for a not-yet-accepted peer before we start dropping.
const PENDING_LINE_CAP: usize = 64;

/// First line on a freshly opened control stream: who we are and whether we
/// want plaintext membership.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Hello {
    name: String,
    trusted: bool,
}

/// Header line opening a file stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileHeader {
    identification: String,
    size: u64,
}

struct Link {
    tx: mpsc::Sender<String>,
    conn: iroh::endpoint::Connection,
    /// False until the engine answered the friend request.
    accepted: bool,
    /// Inbound lines held back until acceptance.
    held: Vec<String>,
    generation: u64,
}

struct Shared {
    endpoint: iroh::Endpoint,
    links: Mutex<HashMap<String, Link>>,
    /// In-flight inbound file writes; the flag aborts the write loop.
    receives: Mutex<HashMap<(String, String), Arc<std::sync::atomic::AtomicBool>>>,
    events: mpsc::Sender<TransportEvent>,
    generation: AtomicU64,
    name: String,
    secret_hex: String,
}

pub struct IrohTransport {
    shared: Arc<Shared>,
}

impl IrohTransport {
    /// Bind the endpoint and start accepting connections. `save_blob` is the
    /// hex secret key from a previous run; `None` generates a fresh
    /// identity.
    pub async fn spawn(
        name: &str,
        save_blob: Option<&str>,
    ) -> Result<(Arc<IrohTransport>, TransportEvents)> {
        let secret_key = match save_blob {
            Some(hex) => hex
                .trim()
                .parse::<iroh::SecretKey>()
                .map_err(|e| anyhow::anyhow!("invalid overlay secret key: {e}"))?,
            None => {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                iroh::SecretKey::from_bytes(&bytes)
            }
        };
        let secret_hex: String = secret_key
            .to_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        let endpoint = iroh::Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await?;
        tracing::info!("overlay endpoint id: {}", endpoint.id());

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            links: Mutex::new(HashMap::new()),
            receives: Mutex::new(HashMap::new()),
            events: events_tx,
            generation: AtomicU64::new(0),
            name: name.to_string(),
            secret_hex,
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => run_connection(conn, true, shared).await,
                        Err(e) => tracing::warn!("incoming overlay connection failed: {e}"),
                    }
                });
            }
            tracing::info!("overlay accept loop ended");
        });

        Ok((Arc::new(IrohTransport { shared }), events_rx))
    }
}

impl Transport for IrohTransport {
    fn address(&self) -> String {
        self.shared.endpoint.id().to_string()
    }

    fn is_online(&self, address: &str) -> bool {
        self.shared
            .links
            .lock()
            .get(address)
            .map(|l| l.accepted)
            .unwrap_or(false)
    }

    async fn connect(&self, address: &str) -> tinzenite_core::Result<()> {
        if self.shared.links.lock().contains_key(address) {
            return Ok(());
        }
        let endpoint_id: iroh::EndpointId = address
            .parse()
            .map_err(|e| CoreError::transport(format!("invalid overlay address: {e}")))?;
        let addr = iroh::EndpointAddr::new(endpoint_id);
        let shared = Arc::clone(&self.shared);
        // Dialing can take a while behind NATs; resolve immediately and let
        // the Connected event carry the outcome.
        tokio::spawn(async move {
            match shared.endpoint.connect(addr, ALPN).await {
                Ok(conn) => run_connection(conn, false, shared).await,
                Err(e) => tracing::debug!("overlay dial failed: {e}"),
            }
        });
        Ok(())
    }

    async fn send_message(&self, address: &str, message: &Message) -> tinzenite_core::Result<()> {
        let tx = {
            let links = self.shared.links.lock();
            match links.get(address) {
                Some(link) if link.accepted => link.tx.clone(),
                _ => return Err(CoreError::PeerOffline(address.to_string())),
            }
        };
        let line = message.encode()?;
        tx.send(line)
            .await
            .map_err(|_| CoreError::PeerOffline(address.to_string()))
    }

    async fn send_file(
        &self,
        address: &str,
        identification: &str,
        path: &Path,
    ) -> tinzenite_core::Result<()> {
        let conn = {
            let links = self.shared.links.lock();
            match links.get(address) {
                Some(link) if link.accepted => link.conn.clone(),
                _ => return Err(CoreError::PeerOffline(address.to_string())),
            }
        };
        send_file_stream(conn, identification, path)
            .await
            .map_err(|e| CoreError::transport(format!("file send failed: {e}")))
    }

    async fn cancel_file(&self, address: &str, identification: &str) {
        let flag = self
            .shared
            .receives
            .lock()
            .remove(&(address.to_string(), identification.to_string()));
        if let Some(flag) = flag {
            flag.store(true, Ordering::Relaxed);
        }
    }

    async fn accept_friend(&self, address: &str) -> tinzenite_core::Result<()> {
        let held = {
            let mut links = self.shared.links.lock();
            let Some(link) = links.get_mut(address) else {
                return Err(CoreError::PeerOffline(address.to_string()));
            };
            link.accepted = true;
            std::mem::take(&mut link.held)
        };
        let _ = self
            .shared
            .events
            .send(TransportEvent::Connected {
                address: address.to_string(),
            })
            .await;
        for line in held {
            let _ = self
                .shared
                .events
                .send(TransportEvent::Message {
                    address: address.to_string(),
                    line,
                })
                .await;
        }
        Ok(())
    }

    fn save_blob(&self) -> Option<String> {
        Some(self.shared.secret_hex.clone())
    }

    async fn close(&self) {
        let links: Vec<iroh::endpoint::Connection> = self
            .shared
            .links
            .lock()
            .drain()
            .map(|(_, link)| link.conn)
            .collect();
        for conn in links {
            conn.close(0u32.into(), b"shutting down");
        }
    }
}

/// Drive one peer connection: control stream, write pump, read pump, and
/// the accept loop for incoming file streams.
async fn run_connection(conn: iroh::endpoint::Connection, incoming: bool, shared: Arc<Shared>) {
    let address = conn.remote_id().to_string();

    let (send, recv) = if incoming {
        match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(%address, "control accept_bi failed: {e}");
                return;
            }
        }
    } else {
        match conn.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(%address, "control open_bi failed: {e}");
                return;
            }
        }
    };

    let (write_tx, mut write_rx) = mpsc::channel::<String>(LINE_CAPACITY);
    let my_gen = shared.generation.fetch_add(1, Ordering::Relaxed);
    {
        let mut links = shared.links.lock();
        if links.contains_key(&address) {
            tracing::debug!(%address, "duplicate overlay link, replacing");
        }
        links.insert(
            address.clone(),
            Link {
                tx: write_tx.clone(),
                conn: conn.clone(),
                // Outgoing dials were initiated by us: no gate to pass.
                accepted: !incoming,
                held: Vec::new(),
                generation: my_gen,
            },
        );
    }

    // Write pump: lines out.
    let write_address = address.clone();
    let write_handle = tokio::spawn(async move {
        let mut send = send;
        while let Some(line) = write_rx.recv().await {
            let framed = format!("{line}\n");
            if let Err(e) = send.write_all(framed.as_bytes()).await {
                tracing::debug!(address = %write_address, "control write failed: {e}");
                break;
            }
            if let Err(e) = send.flush().await {
                tracing::debug!(address = %write_address, "control flush failed: {e}");
                break;
            }
        }
        let _ = send.finish();
    });

    if incoming {
        // The initiator introduces itself; the engine rules on the request.
        await_hello(&conn, recv, &address, &shared).await;
    } else {
        // Introduce ourselves, then report the link as live.
        let hello = Hello {
            name: shared.name.clone(),
            trusted: true,
        };
        if let Ok(line) = serde_json::to_string(&hello) {
            let _ = write_tx.send(line).await;
        }
        let _ = shared
            .events
            .send(TransportEvent::Connected {
                address: address.clone(),
            })
            .await;
        let read_shared = Arc::clone(&shared);
        let read_address = address.clone();
        tokio::spawn(async move {
            read_lines(recv, read_address, read_shared).await;
        });
    }

    // Every further stream the peer opens on this connection is a file.
    let file_shared = Arc::clone(&shared);
    let file_address = address.clone();
    let file_conn = conn.clone();
    let accept_handle = tokio::spawn(async move {
        loop {
            match file_conn.accept_bi().await {
                Ok((fsend, frecv)) => {
                    let shared = Arc::clone(&file_shared);
                    let address = file_address.clone();
                    tokio::spawn(async move {
                        receive_file(fsend, frecv, address, shared).await;
                    });
                }
                Err(e) => {
                    tracing::debug!(address = %file_address, "connection closed: {e}");
                    break;
                }
            }
        }
    });

    // The write pump ends when the connection dies; clean up our entry
    // unless a newer link already replaced it.
    let _ = write_handle.await;
    accept_handle.abort();
    let mut links = shared.links.lock();
    if links
        .get(&address)
        .map(|l| l.generation == my_gen)
        .unwrap_or(false)
    {
        links.remove(&address);
        tracing::info!(%address, "overlay link closed");
    }
}

/// Incoming side: first line must be the Hello; it becomes the friend
/// request the engine answers.
async fn await_hello(
    conn: &iroh::endpoint::Connection,
    recv: iroh::endpoint::RecvStream,
    address: &str,
    shared: &Arc<Shared>,
) {
    let mut lines = LineReader::new(recv);
    let Some(first) = lines.next_line().await else {
        tracing::debug!(%address, "link closed before hello");
        return;
    };
    let hello: Hello = match serde_json::from_str(&first) {
        Ok(hello) => hello,
        Err(e) => {
            tracing::warn!(%address, "malformed hello, closing: {e}");
            conn.close(1u32.into(), b"bad hello");
            return;
        }
    };
    let _ = shared
        .events
        .send(TransportEvent::FriendRequest {
            address: address.to_string(),
            name: hello.name,
            requests_trust: hello.trusted,
        })
        .await;
    let read_shared = Arc::clone(shared);
    let read_address = address.to_string();
    tokio::spawn(async move {
        read_lines_from(lines, read_address, read_shared).await;
    });
}

async fn read_lines(recv: iroh::endpoint::RecvStream, address: String, shared: Arc<Shared>) {
    read_lines_from(LineReader::new(recv), address, shared).await;
}

async fn read_lines_from(mut lines: LineReader, address: String, shared: Arc<Shared>) {
    while let Some(line) = lines.next_line().await {
        // Peers not yet accepted have their traffic held back.
        let deliver = {
            let mut links = shared.links.lock();
            match links.get_mut(&address) {
                Some(link) if link.accepted => true,
                Some(link) => {
                    if link.held.len() < PENDING_LINE_CAP {
                        link.held.push(line.clone());
                    }
                    false
                }
                None => false,
            }
        };
        if deliver
            && shared
                .events
                .send(TransportEvent::Message {
                    address: address.clone(),
                    line,
                })
                .await
                .is_err()
        {
            break;
        }
    }
}

/// Assembles newline-delimited text from a QUIC receive stream.
struct LineReader {
    recv: iroh::endpoint::RecvStream,
    pending: Vec<u8>,
    done: bool,
}

impl LineReader {
    fn new(recv: iroh::endpoint::RecvStream) -> Self {
        LineReader {
            recv,
            pending: Vec::new(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned());
            }
            if self.done {
                return None;
            }
            let mut buf = vec![0u8; 4096];
            match self.recv.read(&mut buf).await {
                Ok(Some(n)) => self.pending.extend_from_slice(&buf[..n]),
                Ok(None) => self.done = true,
                Err(e) => {
                    tracing::debug!("stream read error: {e}");
                    self.done = true;
                }
            }
        }
    }

    /// Whatever arrived after the last consumed line.
    fn into_rest(self) -> (iroh::endpoint::RecvStream, Vec<u8>) {
        (self.recv, self.pending)
    }
}

/// Stream one file to the peer and wait for the receiver's acknowledgement.
async fn send_file_stream(
    conn: iroh::endpoint::Connection,
    identification: &str,
    path: &Path,
) -> Result<()> {
    let size = tokio::fs::metadata(path).await?.len();
    let (mut send, mut recv) = conn.open_bi().await?;

    let header = serde_json::to_string(&FileHeader {
        identification: identification.to_string(),
        size,
    })?;
    send.write_all(format!("{header}\n").as_bytes()).await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        send.write_all(&buf[..n]).await?;
    }
    let _ = send.finish();

    // One byte back means the file is safely on the peer's disk; a closed
    // stream means the offer was denied or the write failed.
    let mut ack = [0u8; 1];
    match recv.read(&mut ack).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => anyhow::bail!("receiver closed without acknowledgement"),
        Err(e) => anyhow::bail!("waiting for acknowledgement: {e}"),
    }
}

/// Receive one offered file, gated by the engine's authorization.
async fn receive_file(
    mut fsend: iroh::endpoint::SendStream,
    frecv: iroh::endpoint::RecvStream,
    address: String,
    shared: Arc<Shared>,
) {
    let mut lines = LineReader::new(frecv);
    let Some(header_line) = lines.next_line().await else {
        return;
    };
    let header: FileHeader = match serde_json::from_str(&header_line) {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!(%address, "malformed file header: {e}");
            return;
        }
    };

    let (decision_tx, decision_rx) = oneshot::channel();
    if shared
        .events
        .send(TransportEvent::AllowFile {
            address: address.clone(),
            identification: header.identification.clone(),
            size: header.size,
            decision: decision_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    let destination = match decision_rx.await {
        Ok(FileDecision::Accept { destination }) => destination,
        _ => {
            tracing::debug!(%address, id = %header.identification, "file offer denied");
            return;
        }
    };

    let key = (address.clone(), header.identification.clone());
    let canceled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    shared.receives.lock().insert(key.clone(), Arc::clone(&canceled));

    let write_shared = Arc::clone(&shared);
    let write_address = address.clone();
    let identification = header.identification.clone();
    let (recv, carry) = lines.into_rest();
    tokio::spawn(async move {
        let outcome = write_stream_to(recv, carry, &destination, &canceled).await;
        write_shared.receives.lock().remove(&key);
        match outcome {
            Ok(true) => {
                // Ack first so the sender resolves, then tell the engine.
                let _ = fsend.write_all(&[1u8]).await;
                let _ = fsend.finish();
                let _ = write_shared
                    .events
                    .send(TransportEvent::FileReceived {
                        address: write_address,
                        identification,
                    })
                    .await;
            }
            Ok(false) => {
                // Canceled from our side; the engine already dropped the
                // transfer record.
                tracing::debug!(address = %write_address, id = %identification, "receive canceled");
            }
            Err(e) => {
                tracing::debug!(address = %write_address, "file receive failed: {e}");
                let _ = write_shared
                    .events
                    .send(TransportEvent::FileCanceled {
                        address: write_address,
                        identification,
                    })
                    .await;
            }
        }
    });
}

/// Returns `Ok(false)` when the transfer was canceled locally.
async fn write_stream_to(
    mut recv: iroh::endpoint::RecvStream,
    carry: Vec<u8>,
    destination: &PathBuf,
    canceled: &std::sync::atomic::AtomicBool,
) -> Result<bool> {
    let mut file = tokio::fs::File::create(destination).await?;
    if !carry.is_empty() {
        file.write_all(&carry).await?;
    }
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if canceled.load(Ordering::Relaxed) {
            drop(file);
            let _ = tokio::fs::remove_file(destination).await;
            return Ok(false);
        }
        match recv.read(&mut buf).await {
            Ok(Some(n)) => file.write_all(&buf[..n]).await?,
            Ok(None) => break,
            Err(e) => {
                let _ = tokio::fs::remove_file(destination).await;
                anyhow::bail!("stream interrupted: {e}");
            }
        }
    }
    file.flush().await?;
    Ok(true)
}
