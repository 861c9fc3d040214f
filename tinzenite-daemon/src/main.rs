mod config;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tinzenite_core::paths::Layout;
use tinzenite_core::peers::SelfRecord;
use tinzenite_core::sync::{EngineOptions, PeerValidator, SyncEngine};
use tinzenite_core::transport::Transport;
use tinzenite_overlay::IrohTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (TINZENITE_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("TINZENITE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("tinzenite_core=info".parse()?)
        .add_directive("tinzenite_overlay=info".parse()?)
        .add_directive("tinzenite_daemon=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = config::DaemonConfig::parse();
    tracing::info!(root = %config.root.display(), "starting");

    // A previous run's overlay identity lives in org/self.json.
    let layout = Layout::new(&config.root);
    let save_blob = SelfRecord::load(&layout.self_file())
        .ok()
        .and_then(|record| record.transport);

    let (transport, events) = IrohTransport::spawn(&config.name, save_blob.as_deref()).await?;
    tracing::info!("overlay address: {}", transport.address());

    let validator: PeerValidator = if config.accept_all {
        Box::new(|address: &str, requests_trust: bool| {
            tracing::warn!(%address, requests_trust, "accept-all: letting peer in");
            true
        })
    } else {
        Box::new(|address: &str, _requests_trust: bool| {
            tracing::info!(%address, "rejecting unknown peer (run with --accept-all to admit)");
            false
        })
    };
    let options = EngineOptions {
        root: config.root.clone(),
        peer_name: config.name.clone(),
        password: config.password.clone(),
        scan_interval: Duration::from_secs(config.scan_interval),
        validator,
    };

    let (engine, handle) = if layout.auth_file().exists() {
        SyncEngine::load(options, transport, events)?
    } else if let Some(user) = &config.create_user {
        let dirname = config.dirname.clone().unwrap_or_else(|| {
            config
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "shared".to_string())
        });
        tracing::info!(%user, %dirname, "provisioning new fleet");
        SyncEngine::create(options, user, &dirname, transport, events)?
    } else if let Some(join) = &config.join {
        tracing::info!(remote = %join, "joining existing fleet");
        SyncEngine::join(options, join, transport, events)?
    } else {
        anyhow::bail!("no auth record at {}: pass --create-user or --join for the first run", layout.auth_file().display());
    };

    let runner = tokio::spawn(engine.run());
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    handle.close().await?;
    runner.await??;
    Ok(())
}
