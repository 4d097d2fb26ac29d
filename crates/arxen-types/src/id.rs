//! Node identifiers and the XOR metric.
//!
//! Identifiers are 256-bit unsigned integers stored big-endian. The XOR of
//! two identifiers is their distance; comparing distances byte-wise from the
//! most significant byte is the same as comparing them numerically.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::TypesError;

/// Number of bits in an identifier (the namespace size).
pub const ID_BITS: usize = 256;

/// Number of bytes in an identifier.
pub const ID_BYTES: usize = ID_BITS / 8;

/// A 256-bit identifier for nodes and stored values.
///
/// Serialized as a raw byte string in binary formats (CBOR) and as a
/// lowercase hex string in human-readable ones (JSON, TOML). Either form is
/// accepted when deserializing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zeros identifier.
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Create a `NodeId` from raw big-endian bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Return the raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate an identifier uniformly at random.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &Self) -> Distance {
        let mut d = [0u8; ID_BYTES];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }

    /// Return a copy of this identifier with bit `index` flipped.
    ///
    /// Bit 0 is the most significant bit. Flipping bit `i` of the local id
    /// yields an id that lands in bucket `i`.
    pub fn with_flipped_bit(&self, index: usize) -> Self {
        let mut bytes = self.0;
        if index < ID_BITS {
            bytes[index / 8] ^= 0x80 >> (index % 8);
        }
        Self(bytes)
    }
}

impl From<u64> for NodeId {
    /// Place `value` in the low 64 bits.
    fn from(value: u64) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| TypesError::InvalidNodeId(e.to_string()))?;
        let bytes: [u8; ID_BYTES] = raw.try_into().map_err(|v: Vec<u8>| {
            TypesError::InvalidNodeId(format!("expected {ID_BYTES} bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 4 bytes are enough to tell peers apart in logs.
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(NodeIdVisitor)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ID_BYTES} bytes or a {}-character hex string", ID_BYTES * 2)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
        <[u8; ID_BYTES]>::try_from(v)
            .map(NodeId)
            .map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
        let mut bytes = [0u8; ID_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(ID_BYTES + 1, &self));
        }
        Ok(NodeId(bytes))
    }
}

/// XOR distance between two identifiers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// The zero distance (identical identifiers).
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Return the raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Number of leading zero bits, which is the shared-prefix length of the
    /// two identifiers. Returns `None` for the zero distance.
    pub fn leading_zeros(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    /// Returns `true` if the distance is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_BYTES]
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
