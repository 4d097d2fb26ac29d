//! arxen: a standalone Kademlia DHT node.
//!
//! Single OS process running a Tokio async runtime. Binds the UDP socket,
//! joins the network through the configured seed nodes, and serves
//! `PING` / `FIND_NODE` / `FIND_VALUE` / `STORE` until interrupted.

mod config;

use std::time::Duration;

use arxen_dht::node::DhtNode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // 2. Initialize tracing; RUST_LOG overrides the configured level.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.log_level)?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Arxen node starting");

    // 3. Start the node
    let node = DhtNode::start(config.node_config()?).await?;

    // 4. Join the network
    match config.bootstrap_config()? {
        Some(bootstrap) => match node.bootstrap(&bootstrap).await {
            Ok(result) => info!(
                responsive_seeds = result.responsive_seeds,
                peers_discovered = result.peers_discovered,
                "Joined network"
            ),
            Err(e) => warn!(error = %e, "Bootstrap failed, serving as standalone node"),
        },
        None => info!("No bootstrap nodes configured, serving as standalone node"),
    }

    // 5. Serve until Ctrl-C
    let mut status = (config.logging.status_interval_secs > 0).then(|| {
        tokio::time::interval(Duration::from_secs(config.logging.status_interval_secs))
    });
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            _ = tick(&mut status) => {
                let stats = node.stats();
                info!(
                    contacts = node.routing_table_len().await,
                    requests_handled = stats.requests_handled,
                    responses_delivered = stats.responses_delivered,
                    unknown_responses = stats.unknown_responses,
                    decode_failures = stats.decode_failures,
                    timeouts = stats.timeouts,
                    "Node status"
                );
            }
        }
    }

    // Graceful shutdown
    node.shutdown().await;
    info!("Node stopped");
    Ok(())
}

/// Next status tick, or never when status lines are disabled.
async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
