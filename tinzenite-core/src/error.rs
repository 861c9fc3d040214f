//! Error type shared across the engine.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    /// The queried path or identification is not in the tracked set.
    #[error("object not tracked: {0}")]
    NotTracked(String),

    /// A version counter would exceed its range. Fatal for the object.
    #[error("version counter overflow for object {0}")]
    VersionOverflow(String),

    /// A second concurrent outbound send for the same `(peer, identification)`.
    #[error("transfer already in progress: {identification} -> {address}")]
    AlreadyInProgress {
        address: String,
        identification: String,
    },

    #[error("peer offline: {0}")]
    PeerOffline(String),

    /// Sealed envelope failed to open (wrong key or corrupted ciphertext).
    #[error("envelope failed to open")]
    EnvelopeOpen,

    #[error("sealing failed")]
    EnvelopeSeal,

    #[error("password mismatch")]
    PasswordMismatch,

    #[error("password hashing: {0}")]
    PasswordHash(String),

    /// A message that is syntactically valid but not legal in context.
    #[error("illegal message: {0}")]
    IllegalMessage(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }
}
