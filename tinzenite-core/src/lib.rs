//! Peer-to-peer synchronization engine for a shared directory tree.
//!
//! A fleet of user-owned devices each watches a local directory and
//! exchanges updates over an encrypted overlay until every trusted peer
//! converges on the same tree. Causal history rides on per-peer version
//! vectors; concurrent edits surface as `.LOCAL`/`.REMOTE` sibling files
//! instead of silent overwrites. Encrypted peers participate as blind
//! stores that hold sealed payloads without ever seeing plaintext.
//!
//! The crate is transport-agnostic: the engine consumes the [`transport`]
//! contract, and an implementation (see `tinzenite-overlay`) supplies it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tinzenite_core::sync::{EngineOptions, SyncEngine};
//! # async fn demo<T: tinzenite_core::transport::Transport>(
//! #     transport: Arc<T>,
//! #     events: tinzenite_core::transport::TransportEvents,
//! # ) -> tinzenite_core::Result<()> {
//! let options = EngineOptions {
//!     root: "/data/shared".into(),
//!     peer_name: "laptop".into(),
//!     password: "hunter2".into(),
//!     scan_interval: Duration::from_secs(30),
//!     validator: Box::new(|_address, _trusted| false),
//! };
//! let (engine, handle) = SyncEngine::create(options, "anna", "shared", transport, events)?;
//! tokio::spawn(engine.run());
//! handle.scan().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod hashing;
pub mod ids;
pub mod matcher;
pub mod merge;
pub mod messages;
pub mod model;
pub mod object;
pub mod paths;
pub mod peers;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod version;

pub use error::{Error, Result};
