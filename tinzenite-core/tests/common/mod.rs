//! In-memory transport for engine tests: every registered endpoint is
//! reachable, messages are delivered in send order, and file transfers run
//! through the same offer/accept gate the real overlay uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use tinzenite_core::messages::Message;
use tinzenite_core::transport::{FileDecision, Transport, TransportEvent, TransportEvents};
use tinzenite_core::{Error, Result};

#[derive(Default)]
pub struct Net {
    peers: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
}

impl Net {
    pub fn new() -> Arc<Net> {
        Arc::new(Net::default())
    }

    fn sender(&self, address: &str) -> Option<mpsc::Sender<TransportEvent>> {
        self.peers.lock().unwrap().get(address).cloned()
    }
}

pub struct TestTransport {
    address: String,
    net: Arc<Net>,
}

impl TestTransport {
    pub fn join(net: &Arc<Net>, address: &str) -> (Arc<TestTransport>, TransportEvents) {
        let (tx, rx) = mpsc::channel(1024);
        net.peers.lock().unwrap().insert(address.to_string(), tx);
        (
            Arc::new(TestTransport {
                address: address.to_string(),
                net: Arc::clone(net),
            }),
            rx,
        )
    }
}

impl Transport for TestTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn is_online(&self, address: &str) -> bool {
        address != self.address && self.net.sender(address).is_some()
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let Some(remote) = self.net.sender(address) else {
            return Err(Error::PeerOffline(address.to_string()));
        };
        let _ = remote
            .send(TransportEvent::FriendRequest {
                address: self.address.clone(),
                name: self.address.clone(),
                requests_trust: true,
            })
            .await;
        if let Some(local) = self.net.sender(&self.address) {
            let _ = local
                .send(TransportEvent::Connected {
                    address: address.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn send_message(&self, address: &str, message: &Message) -> Result<()> {
        let Some(remote) = self.net.sender(address) else {
            return Err(Error::PeerOffline(address.to_string()));
        };
        let line = message.encode()?;
        remote
            .send(TransportEvent::Message {
                address: self.address.clone(),
                line,
            })
            .await
            .map_err(|_| Error::PeerOffline(address.to_string()))
    }

    async fn send_file(
        &self,
        address: &str,
        identification: &str,
        path: &std::path::Path,
    ) -> Result<()> {
        let Some(remote) = self.net.sender(address) else {
            return Err(Error::PeerOffline(address.to_string()));
        };
        let bytes = std::fs::read(path)?;
        let (decision_tx, decision_rx) = oneshot::channel();
        remote
            .send(TransportEvent::AllowFile {
                address: self.address.clone(),
                identification: identification.to_string(),
                size: bytes.len() as u64,
                decision: decision_tx,
            })
            .await
            .map_err(|_| Error::PeerOffline(address.to_string()))?;
        match decision_rx.await {
            Ok(FileDecision::Accept { destination }) => {
                std::fs::write(&destination, &bytes)?;
                remote
                    .send(TransportEvent::FileReceived {
                        address: self.address.clone(),
                        identification: identification.to_string(),
                    })
                    .await
                    .map_err(|_| Error::PeerOffline(address.to_string()))?;
                Ok(())
            }
            _ => Err(Error::transport("file offer denied")),
        }
    }

    async fn cancel_file(&self, _address: &str, _identification: &str) {}

    async fn accept_friend(&self, address: &str) -> Result<()> {
        if let Some(local) = self.net.sender(&self.address) {
            let _ = local
                .send(TransportEvent::Connected {
                    address: address.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.net.peers.lock().unwrap().remove(&self.address);
    }
}

/// Poll until `condition` holds or `deadline` passes.
pub async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, condition: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}
