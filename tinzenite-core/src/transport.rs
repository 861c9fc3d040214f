//! The contract between the engine and the overlay network.
//!
//! The overlay runs its own tasks; everything it observes crosses into the
//! engine as a [`TransportEvent`] on an mpsc channel, so all engine state
//! stays single-threaded. Outbound operations are the [`Transport`] trait.
//! Futures are declared `Send` so the engine loop can run under `tokio::spawn`.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::messages::Message;

/// Reply to an incoming file offer.
#[derive(Debug)]
pub enum FileDecision {
    /// Write the incoming bytes to `destination`.
    Accept { destination: PathBuf },
    Deny,
}

/// What the overlay reports to the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// Someone wants into the fleet. The engine consults the validation
    /// callback and answers via [`Transport::accept_friend`].
    FriendRequest {
        address: String,
        name: String,
        requests_trust: bool,
    },
    Connected {
        address: String,
    },
    /// One line from a control stream, not yet parsed.
    Message {
        address: String,
        line: String,
    },
    /// An incoming file offer awaiting authorization.
    AllowFile {
        address: String,
        identification: String,
        size: u64,
        decision: oneshot::Sender<FileDecision>,
    },
    /// The accepted file is fully written to its destination.
    FileReceived {
        address: String,
        identification: String,
    },
    FileCanceled {
        address: String,
        identification: String,
    },
}

pub type TransportEvents = mpsc::Receiver<TransportEvent>;

pub trait Transport: Send + Sync + 'static {
    /// Our own overlay address.
    fn address(&self) -> String;

    fn is_online(&self, address: &str) -> bool;

    fn connect(&self, address: &str) -> impl Future<Output = Result<()>> + Send;

    fn send_message(
        &self,
        address: &str,
        message: &Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stream a file to a peer under the given identification. Resolves when
    /// the peer has the full file or the send failed.
    fn send_file(
        &self,
        address: &str,
        identification: &str,
        path: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Best-effort abort of an in-flight incoming file.
    fn cancel_file(&self, address: &str, identification: &str)
    -> impl Future<Output = ()> + Send;

    fn accept_friend(&self, address: &str) -> impl Future<Output = Result<()>> + Send;

    /// Opaque state persisted into `org/self.json`.
    fn save_blob(&self) -> Option<String> {
        None
    }

    fn close(&self) -> impl Future<Output = ()> + Send;
}
