//! # arxen-transport
//!
//! Datagram transport and RPC wire format for the Arxen Kademlia node.
//!
//! - **UDP transport** with independent receive and send loops via [`udp`]
//! - **RPC envelope** (CBOR-serialized, 1460-byte ceiling) via [`wire`]
//! - **Command set** and per-command argument/result shapes via [`messages`]
//! - **CBOR serialization** helpers via [`cbor`]
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher
//!     |
//!     v
//! Envelope (wire.rs)        -- node, type, rpc_id, command/arg | result_type/result
//!     |
//!     v
//! UdpTransport (udp.rs)     -- outbound queue -> send loop, recv loop -> inbound queue
//!     |
//!     v
//! UDP socket (default port 55667)
//! ```

pub mod cbor;
pub mod messages;
pub mod udp;
pub mod wire;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The UDP socket could not be bound. Fatal at startup.
    #[error("bind failed: {0}")]
    Binding(String),

    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed inbound payload.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// An encoded datagram would exceed the maximum payload size.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
