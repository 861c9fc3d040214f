use std::path::PathBuf;

use clap::Parser;

/// Daemon configuration, from flags or environment.
#[derive(Debug, Parser)]
#[command(name = "tinzenite-daemon", about = "Peer-to-peer directory synchronization daemon")]
pub struct DaemonConfig {
    /// Directory to synchronize.
    #[arg(long, env = "TINZENITE_ROOT")]
    pub root: PathBuf,

    /// Display name of this device.
    #[arg(long, env = "TINZENITE_NAME", default_value = "tinzenite")]
    pub name: String,

    /// Fleet password.
    #[arg(long, env = "TINZENITE_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// First run only: create a new fleet owned by this user name.
    #[arg(long, conflicts_with = "join")]
    pub create_user: Option<String>,

    /// Human-readable name for the shared directory (with --create-user).
    #[arg(long)]
    pub dirname: Option<String>,

    /// First run only: join an existing fleet via this overlay address.
    #[arg(long)]
    pub join: Option<String>,

    /// Seconds between directory scans.
    #[arg(long, default_value_t = 30)]
    pub scan_interval: u64,

    /// Accept every peer that asks to join. Convenient for testing; in real
    /// fleets leave this off and add peers deliberately.
    #[arg(long)]
    pub accept_all: bool,
}
