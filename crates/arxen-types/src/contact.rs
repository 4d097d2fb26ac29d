//! Reachable peers.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{NodeId, TypesError};

/// A peer: its identifier plus the address it can be reached at.
///
/// Two contacts are equal when their ids are equal, whatever their
/// addresses. On the wire a contact is `{"id", "ip", "port"}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(into = "WireContact", try_from = "WireContact")]
pub struct Contact {
    /// The peer's identifier.
    pub id: NodeId,
    /// The peer's UDP address.
    pub addr: SocketAddr,
}

impl Contact {
    /// Create a contact.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// The same peer reached at a different address.
    pub fn with_addr(self, addr: SocketAddr) -> Self {
        Self { id: self.id, addr }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Serialize, Deserialize)]
struct WireContact {
    id: NodeId,
    ip: String,
    port: u16,
}

impl From<Contact> for WireContact {
    fn from(contact: Contact) -> Self {
        Self {
            id: contact.id,
            ip: contact.addr.ip().to_string(),
            port: contact.addr.port(),
        }
    }
}

impl TryFrom<WireContact> for Contact {
    type Error = TypesError;

    fn try_from(wire: WireContact) -> Result<Self, Self::Error> {
        let ip: IpAddr = wire
            .ip
            .parse()
            .map_err(|_| TypesError::InvalidAddress(wire.ip.clone()))?;
        Ok(Self {
            id: wire.id,
            addr: SocketAddr::new(ip, wire.port),
        })
    }
}
