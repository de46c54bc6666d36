//! Hybrid Node Miner - Main Application
//!
//! Brings up the configured node, prints its notifications and optionally
//! mines: through the daemon for a remote node, locally with the built-in
//! regtest wallet for an embedded node.

use anyhow::{Context, Result};
use hybrid_node_miner::{
    config::{Config, NodeMode},
    logging::init_logging,
    miner::Miner,
    node::{EmbeddedNode, EventSink, EventStream, Node, NodeEvent, RemoteNode},
    wallet::RegtestWallet,
    APP_NAME, APP_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Main loop tick driving miner maintenance
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Interval of the hash rate log line
const SPEED_REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await.context("Failed to load configuration")?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let _log_guard = init_logging(config.log_level, config.log_format, config.log_dir.as_deref())
        .context("Failed to initialize logging")?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: node={}, threads={}, mining={}",
        config.node,
        config.threads,
        config.mining_address.is_some()
    );

    let (events, stream) = EventSink::channel();
    match config.node {
        NodeMode::Remote => run_remote(config, events, stream).await,
        NodeMode::Embedded => run_embedded(config, events, stream).await,
    }
}

/// Run `init` and wait for its completion callback
async fn init_node(node: &dyn Node) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    node.init(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await
        .context("Node dropped its init callback")?
        .with_context(|| format!("Failed to initialize {} node", node.name()))?;
    Ok(())
}

async fn run_remote(config: Config, events: EventSink, mut stream: EventStream) -> Result<()> {
    let node = Arc::new(RemoteNode::new(
        config.remote_node_config()?,
        config.currency.clone(),
        events,
    )?);
    init_node(node.as_ref()).await?;

    let wallet = node.clone().create_wallet();
    info!(
        wallet = %wallet.id(),
        height = wallet.sync_height().await,
        "Connected to daemon at {}",
        config.daemon_url()
    );

    if let Some(address) = &config.mining_address {
        if let Err(e) = node.start_mining(address, config.threads).await {
            warn!("Daemon mining not started: {}", e);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = stream.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
        }
    }

    if config.mining_address.is_some() {
        if let Err(e) = node.stop_mining().await {
            warn!("Failed to stop daemon mining: {}", e);
        }
    }
    node.deinit();
    Ok(())
}

async fn run_embedded(config: Config, events: EventSink, mut stream: EventStream) -> Result<()> {
    let node = Arc::new(
        EmbeddedNode::regtest(
            config.embedded_node_config()?,
            config.currency.clone(),
            events,
        )
        .context("Failed to open embedded node")?,
    );
    init_node(node.as_ref()).await?;
    if let Some(addr) = node.p2p_local_addr() {
        info!("Embedded node accepting peers on {}", addr);
    }

    let wallet = Arc::new(RegtestWallet::new(
        config.currency.clone(),
        config.regtest_balance,
    ));
    let miner = Miner::new(
        config.miner_config()?,
        config.currency.clone(),
        node.clone(),
        wallet,
    )?;

    if let Some(address) = &config.mining_address {
        if let Err(e) = miner.start(address, config.threads).await {
            error!("Failed to start mining: {}", e);
        }
    }

    let mut maintenance = interval(MAINTENANCE_TICK);
    let mut report = interval(SPEED_REPORT_INTERVAL);
    let mut local_height = 0u64;
    let mut known_height = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = stream.recv() => {
                let Some(event) = event else { break };
                log_event(event);
                match event {
                    NodeEvent::LocalHeightChanged(height) => {
                        local_height = height;
                        let miner = miner.clone();
                        tokio::spawn(async move { miner.on_block_chain_update().await });
                    }
                    NodeEvent::KnownHeightChanged(height) => known_height = height,
                    _ => {}
                }

                if known_height > local_height + 1 {
                    miner.on_synchronization_lost().await;
                } else {
                    miner.on_synchronized().await;
                }
            }
            _ = maintenance.tick() => miner.on_idle().await,
            _ = report.tick() => {
                if miner.is_mining() {
                    info!(
                        "Hash rate: {}, blocks found: {}",
                        miner.speed(),
                        miner.blocks_found()
                    );
                }
            }
        }
    }

    miner.stop_async().await;
    node.deinit();
    // Give the node task a moment to release storage
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

fn log_event(event: NodeEvent) {
    match event {
        NodeEvent::PeerCountChanged(count) => info!("Peers: {}", count),
        NodeEvent::LocalHeightChanged(height) => info!("Local height: {}", height),
        NodeEvent::KnownHeightChanged(height) => info!("Known height: {}", height),
        NodeEvent::ConnectivityChanged(true) => info!("Node is reachable"),
        NodeEvent::ConnectivityChanged(false) => warn!("Node is unreachable"),
    }
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_printing() {
        let config = Config::try_parse_from(["hybrid-node-miner", "--node", "embedded"]).unwrap();
        assert!(print_configuration(&config).is_ok());
    }
}
