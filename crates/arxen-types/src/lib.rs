//! # arxen-types
//!
//! Shared value types for the Arxen Kademlia node.
//!
//! - [`NodeId`]: 256-bit identifier in the shared key space, also used as
//!   the key of stored values.
//! - [`Distance`]: XOR distance between two identifiers, ordered numerically.
//! - [`Contact`]: a reachable `(NodeId, SocketAddr)` pair. Equality is by id.

pub mod contact;
pub mod id;

pub use contact::Contact;
pub use id::{Distance, NodeId, ID_BITS, ID_BYTES};

/// Errors raised while parsing identifiers and contacts.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A node identifier was not 32 bytes of valid hex.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// A contact carried an unparseable IP address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Convenience result type for type conversions.
pub type Result<T> = std::result::Result<T, TypesError>;
