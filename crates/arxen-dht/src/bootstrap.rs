//! Joining the network through seed nodes.
//!
//! When a node starts, its routing table is empty. The bootstrap process:
//!
//! 1. Pings each seed node, with retries. A seed that answers is learned
//!    into the routing table by the dispatcher like any other responder.
//! 2. Fails if fewer than `min_responsive_seeds` answered.
//! 3. Performs a `FIND_NODE` lookup for the local node's own id, which
//!    populates the buckets nearest to it.
//!
//! ## Configuration
//!
//! [`BootstrapConfig`] specifies the seed nodes and retry parameters.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use arxen_types::{Contact, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::lookup::{CancelToken, LookupCoordinator};
use crate::{DhtError, Result};

/// Configuration for the bootstrap process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Seed node addresses to contact initially.
    pub seed_nodes: Vec<SocketAddr>,
    /// Ping attempts per seed node.
    pub max_retries: u32,
    /// Timeout for each ping attempt in milliseconds.
    pub timeout_ms: u64,
    /// Seeds that must respond for bootstrap to succeed.
    pub min_responsive_seeds: usize,
}

/// The result of a bootstrap attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapResult {
    /// Seeds that responded.
    pub responsive_seeds: usize,
    /// Contacts returned by the self-lookup.
    pub peers_discovered: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            max_retries: 3,
            timeout_ms: 2_000,
            min_responsive_seeds: 1,
        }
    }
}

impl BootstrapConfig {
    /// Default retry settings for `seed_nodes`.
    pub fn new(seed_nodes: Vec<SocketAddr>) -> Self {
        Self {
            seed_nodes,
            ..Default::default()
        }
    }

    /// Reject configurations that can never succeed.
    pub fn validate(&self) -> Result<()> {
        if self.seed_nodes.is_empty() {
            return Err(DhtError::BootstrapFailed(
                "no seed nodes configured".to_string(),
            ));
        }

        if self.min_responsive_seeds > self.seed_nodes.len() {
            return Err(DhtError::BootstrapFailed(format!(
                "min_responsive_seeds ({}) exceeds total seed nodes ({})",
                self.min_responsive_seeds,
                self.seed_nodes.len(),
            )));
        }

        if self.max_retries == 0 {
            return Err(DhtError::BootstrapFailed(
                "max_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Network operations bootstrap needs.
///
/// Implemented by [`LookupCoordinator`]; tests substitute a scripted peer set.
pub trait BootstrapTransport {
    /// The local node's id.
    fn local_id(&self) -> NodeId;

    /// Ping `addr` and return the responder's contact.
    fn ping(&self, addr: SocketAddr, timeout: Duration) -> impl Future<Output = Result<Contact>> + Send;

    /// Run an iterative `FIND_NODE` lookup and return the contacts found.
    fn find_node(&self, target: NodeId) -> impl Future<Output = Vec<Contact>> + Send;
}

impl BootstrapTransport for LookupCoordinator {
    fn local_id(&self) -> NodeId {
        self.dispatcher().local().id
    }

    async fn ping(&self, addr: SocketAddr, timeout: Duration) -> Result<Contact> {
        self.dispatcher().ping_with_timeout(addr, timeout).await
    }

    async fn find_node(&self, target: NodeId) -> Vec<Contact> {
        LookupCoordinator::find_node(self, target, CancelToken::never())
            .await
            .closest
    }
}

/// Join the network through `config.seed_nodes`.
///
/// # Errors
///
/// [`DhtError::BootstrapFailed`] if the configuration is invalid or too few
/// seeds respond.
pub async fn bootstrap<T: BootstrapTransport>(
    config: &BootstrapConfig,
    transport: &T,
) -> Result<BootstrapResult> {
    config.validate()?;

    info!(seed_count = config.seed_nodes.len(), "Starting DHT bootstrap");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut responsive_seeds = 0usize;

    for &addr in &config.seed_nodes {
        let mut connected = false;
        for attempt in 1..=config.max_retries {
            debug!(%addr, attempt, "Pinging seed node");
            match transport.ping(addr, timeout).await {
                Ok(contact) => {
                    responsive_seeds += 1;
                    connected = true;
                    info!(%addr, peer = %contact.id, "Seed node responded");
                    break;
                }
                Err(e) => {
                    warn!(%addr, attempt, error = %e, "Seed node ping failed");
                }
            }
        }
        if !connected {
            warn!(%addr, "Failed to reach seed node after all retries");
        }
    }

    if responsive_seeds < config.min_responsive_seeds {
        return Err(DhtError::BootstrapFailed(format!(
            "only {} of {} required seed nodes responded",
            responsive_seeds, config.min_responsive_seeds,
        )));
    }

    let discovered = transport.find_node(transport.local_id()).await;
    let result = BootstrapResult {
        responsive_seeds,
        peers_discovered: discovered.len(),
    };

    info!(
        responsive_seeds = result.responsive_seeds,
        peers_discovered = result.peers_discovered,
        "Bootstrap complete"
    );

    Ok(result)
}
