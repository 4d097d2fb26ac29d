//! # arxen-dht
//!
//! Kademlia distributed hash table node for the Arxen network.
//!
//! This crate implements:
//! - Kademlia routing table with XOR-distance metric and liveness-checked
//!   eviction ([`routing`])
//! - RPC dispatcher correlating responses to pending requests over UDP
//!   ([`dispatcher`])
//! - Iterative concurrent `FIND_NODE` / `FIND_VALUE` lookups ([`lookup`])
//! - `STORE` / `FIND_VALUE` handling against a pluggable persistence backend
//!   ([`store`])
//! - Bootstrap logic for joining the network via seed nodes ([`bootstrap`])
//! - The [`node::DhtNode`] facade tying these together
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size, shortlist size) | 20 |
//! | alpha (probes per lookup round) | 10 |
//! | Buckets | 256 |
//! | RPC timeout | 5 seconds |
//! | Max lookup rounds | 16 |
//! | Max datagram payload | 1460 bytes |

use std::net::SocketAddr;
use std::time::Duration;

use arxen_transport::wire::RpcId;
use arxen_transport::TransportError;

pub mod bootstrap;
pub mod dispatcher;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod store;
pub mod supervisor;

/// Kademlia bucket size: maximum contacts per bucket and per lookup shortlist.
pub const K: usize = 20;

/// Maximum concurrent probes per lookup round.
pub const ALPHA: usize = 10;

/// Number of buckets in the routing table (one per bit of the 256-bit key space).
pub const NUM_BUCKETS: usize = arxen_types::ID_BITS;

/// Default RPC timeout in milliseconds.
pub const RPC_TIMEOUT_MS: u64 = 5_000;

/// Default upper bound on lookup rounds.
pub const MAX_LOOKUP_ROUNDS: usize = 16;

/// Default overall lookup deadline in seconds.
pub const LOOKUP_TIMEOUT_SECS: u64 = 60;

/// Tunables shared by the dispatcher and the lookup coordinator.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity and shortlist size.
    pub k: usize,
    /// Probes issued per lookup round.
    pub alpha: usize,
    /// Deadline for a single request/response exchange.
    pub rpc_timeout: Duration,
    /// Lookup rounds before giving up with the shortlist held.
    pub max_rounds: usize,
    /// Deadline for a whole lookup.
    pub lookup_timeout: Duration,
    /// After a successful `FIND_VALUE` lookup, store the value at the closest
    /// responder that lacked it.
    pub cache_found_values: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            max_rounds: MAX_LOOKUP_ROUNDS,
            lookup_timeout: Duration::from_secs(LOOKUP_TIMEOUT_SECS),
            cache_found_values: true,
        }
    }
}

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// No RESPONSE arrived before the deadline.
    #[error("request to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    /// A RESPONSE arrived for a correlation id nobody is waiting on.
    #[error("response {rpc_id} matches no pending request")]
    UnknownResponse { rpc_id: RpcId },

    /// The peer answered with a result of the wrong shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The peer answered with a protocol error.
    #[error("remote error: {0}")]
    Remote(String),

    /// Bootstrap failed to reach enough seed nodes.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// The node is shutting down.
    #[error("dispatcher stopped")]
    Shutdown,

    /// Socket, queue, or codec failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
