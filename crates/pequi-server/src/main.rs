//! Main entry point for a Pequi node.
//!
//! Loads configuration, wires the object manager, invocation registry and
//! peer manager together, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pequi_object::{InvocationRegistry, ObjectManager, ObjectManagerConfig};
use pequi_peer::{
    FileNodeStore, MemoryNodeStore, NodeStore, PeerManager, PeerManagerConfig, TcpTransport,
};

#[derive(Parser, Debug)]
#[command(name = "pequi-server", about = "Pequi cluster node")]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "PEQUI_CONFIG")]
    config: Option<PathBuf>,

    /// Node name override
    #[arg(long, env = "PEQUI_NODE_NAME")]
    node_name: Option<String>,

    /// Run without a shared node store (single-node mode)
    #[arg(long, default_value_t = false)]
    standalone: bool,
}

fn load_settings(args: &Args) -> anyhow::Result<config::Config> {
    let mut builder = config::Config::builder()
        .set_default("pequi.server.port", pequi_common::DEFAULT_PEER_PORT as i64)?
        .set_default("pequi.cluster.secret", "")?
        .set_default("pequi.cluster.store-dir", "data/nodes")?
        .set_default(
            "pequi.cluster.heartbeat-interval-ms",
            pequi_common::DEFAULT_HEARTBEAT_INTERVAL_MS as i64,
        )?
        .set_default(
            "pequi.cluster.stale-window-ms",
            pequi_common::DEFAULT_STALE_WINDOW_MS as i64,
        )?;

    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.clone()));
    }

    builder.build().context("failed to load configuration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;

    let node_name = args
        .node_name
        .clone()
        .or_else(|| settings.get_string("pequi.node.name").ok())
        .context("node name not configured (--node-name or pequi.node.name)")?;
    let shared_secret = settings
        .get_string("pequi.cluster.secret")
        .unwrap_or_default();
    if !args.standalone && shared_secret.is_empty() {
        anyhow::bail!("pequi.cluster.secret must be set in cluster mode");
    }

    let mut peer_config = PeerManagerConfig::new(node_name.clone(), shared_secret);
    if let Ok(host) = settings.get_string("pequi.server.host") {
        peer_config.host_name = host;
    }
    if let Ok(public_host) = settings.get_string("pequi.server.public-host") {
        peer_config.public_host_name = Some(public_host);
    }
    if let Ok(region) = settings.get_string("pequi.server.region") {
        peer_config.region = Some(region);
    }
    if let Ok(port) = settings.get_int("pequi.server.port") {
        peer_config.port = port as u16;
    }
    if let Ok(bind) = settings.get_string("pequi.server.bind") {
        peer_config.bind_address = Some(bind);
    }
    if let Ok(interval) = settings.get_int("pequi.cluster.heartbeat-interval-ms") {
        peer_config.heartbeat_interval = Duration::from_millis(interval as u64);
    }
    if let Ok(window) = settings.get_int("pequi.cluster.stale-window-ms") {
        peer_config.stale_window = Duration::from_millis(window as u64);
    }

    let store: Arc<dyn NodeStore> = if args.standalone {
        info!("standalone mode - using in-memory node store");
        Arc::new(MemoryNodeStore::new())
    } else {
        let dir = settings
            .get_string("pequi.cluster.store-dir")
            .unwrap_or_else(|_| "data/nodes".to_string());
        Arc::new(FileNodeStore::new(dir)?)
    };

    let objects = ObjectManager::new(ObjectManagerConfig {
        name: node_name.clone(),
        ..Default::default()
    });
    let handle = objects.handle();
    let invocations = InvocationRegistry::new(handle.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to start invocation registry: {}", e))?;

    let peers = PeerManager::start(
        peer_config,
        handle.clone(),
        invocations,
        store,
        Arc::new(TcpTransport::new()),
    )
    .await
    .context("failed to start peer manager")?;

    info!(node = %node_name, "pequi node running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    peers.shutdown().await;
    handle.shutdown().await;
    Ok(())
}
