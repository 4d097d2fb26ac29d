//! Command set and payload shapes of the Kademlia RPC protocol.
//!
//! | Command | REQUEST `arg` | RESPONSE `result_type` |
//! |---|---|---|
//! | `PING` | `{seq_value}` | `seq_value` (echo) |
//! | `FIND_NODE` | `{node_id}` | `node_list` |
//! | `FIND_VALUE` | `{value_id}` | `value` or `node_list` |
//! | `STORE` | `{value_id, data}` | `success_boolean` |
//!
//! Any other command string decodes to [`Request::Unrecognized`] and is
//! answered with an `error` result.

use arxen_types::{Contact, NodeId};
use serde::{Deserialize, Serialize};

/// Liveness probe.
pub const CMD_PING: &str = "PING";
/// Locate the contacts closest to an id.
pub const CMD_FIND_NODE: &str = "FIND_NODE";
/// Fetch a value, or the contacts closest to its key.
pub const CMD_FIND_VALUE: &str = "FIND_VALUE";
/// Store a value at the receiver.
pub const CMD_STORE: &str = "STORE";

/// Result type tag for a list of contacts.
pub const RESULT_NODE_LIST: &str = "node_list";
/// Result type tag for a stored value.
pub const RESULT_VALUE: &str = "value";
/// Result type tag for a PING echo.
pub const RESULT_SEQ_VALUE: &str = "seq_value";
/// Result type tag for a STORE outcome.
pub const RESULT_SUCCESS_BOOLEAN: &str = "success_boolean";
/// Result type tag for a protocol error.
pub const RESULT_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// Request arguments
// ---------------------------------------------------------------------------

/// `PING` argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    /// Sequence number echoed back by the responder.
    pub seq_value: u64,
}

/// `FIND_NODE` argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeArgs {
    /// Identifier whose closest contacts are requested.
    pub node_id: NodeId,
}

/// `FIND_VALUE` argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValueArgs {
    /// Key of the requested value.
    pub value_id: NodeId,
}

/// `STORE` argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreArgs {
    /// Key under which to store.
    pub value_id: NodeId,
    /// The value, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A decoded REQUEST, one variant per command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Ping(PingArgs),
    FindNode(FindNodeArgs),
    FindValue(FindValueArgs),
    Store(StoreArgs),
    /// A structurally valid request naming a command this node does not know.
    Unrecognized { command: String },
}

impl Request {
    /// A `FIND_NODE` request for `target`.
    pub fn find_node(target: NodeId) -> Self {
        Request::FindNode(FindNodeArgs { node_id: target })
    }

    /// A `FIND_VALUE` request for `key`.
    pub fn find_value(key: NodeId) -> Self {
        Request::FindValue(FindValueArgs { value_id: key })
    }

    /// A `STORE` request.
    pub fn store(key: NodeId, data: Vec<u8>) -> Self {
        Request::Store(StoreArgs {
            value_id: key,
            data,
        })
    }

    /// The wire name of this request's command.
    pub fn command(&self) -> &str {
        match self {
            Request::Ping(_) => CMD_PING,
            Request::FindNode(_) => CMD_FIND_NODE,
            Request::FindValue(_) => CMD_FIND_VALUE,
            Request::Store(_) => CMD_STORE,
            Request::Unrecognized { command } => command,
        }
    }
}

// ---------------------------------------------------------------------------
// Response results
// ---------------------------------------------------------------------------

/// A decoded RESPONSE result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcResult {
    /// Contacts closest to the requested id, nearest first.
    NodeList(Vec<Contact>),
    /// The stored value.
    Value(Vec<u8>),
    /// PING echo.
    SeqValue(u64),
    /// Outcome of a STORE.
    SuccessBoolean(bool),
    /// The responder could not serve the request.
    Error(String),
}

impl RpcResult {
    /// The wire `result_type` tag.
    pub fn result_type(&self) -> &'static str {
        match self {
            RpcResult::NodeList(_) => RESULT_NODE_LIST,
            RpcResult::Value(_) => RESULT_VALUE,
            RpcResult::SeqValue(_) => RESULT_SEQ_VALUE,
            RpcResult::SuccessBoolean(_) => RESULT_SUCCESS_BOOLEAN,
            RpcResult::Error(_) => RESULT_ERROR,
        }
    }
}

/// Serde support for byte payloads as base64 text.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
