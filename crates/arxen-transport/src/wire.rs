//! RPC envelope for the Arxen wire protocol.
//!
//! Every datagram carries exactly one CBOR-encoded envelope.
//!
//! ## Wire format
//!
//! ```text
//! {
//!   node:           {id, ip, port},        // sender contact
//!   type:           "REQUEST" | "RESPONSE",
//!   rpc_id:         u64,                   // correlation token
//!   command:        text,                  // REQUEST only
//!   arg:            map,                   // REQUEST only
//!   request_rpc_id: u64,                   // RESPONSE only
//!   result_type:    text,                  // RESPONSE only
//!   result:         any,                   // RESPONSE only
//! }
//! ```
//!
//! A RESPONSE reuses the `rpc_id` of the REQUEST it answers and repeats it
//! in `request_rpc_id`.

use std::fmt;

use arxen_types::Contact;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::messages::{
    FindNodeArgs, FindValueArgs, PingArgs, Request, RpcResult, StoreArgs, CMD_FIND_NODE,
    CMD_FIND_VALUE, CMD_PING, CMD_STORE, RESULT_ERROR, RESULT_NODE_LIST, RESULT_SEQ_VALUE,
    RESULT_SUCCESS_BOOLEAN, RESULT_VALUE,
};
use crate::TransportError;

/// Maximum size of one encoded envelope (one UDP datagram payload).
pub const MAX_DATAGRAM_SIZE: usize = 1460;

/// Largest stored value whose `value` RESPONSE still fits in one datagram,
/// whatever the responder's address. Values travel base64-encoded.
pub const MAX_VALUE_SIZE: usize = 900;

/// Correlation token linking a REQUEST to its RESPONSE.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(pub u64);

impl RpcId {
    /// A fresh random token.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({:016x})", self.0)
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Direction-specific part of an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(RpcResult),
}

/// One RPC message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The sender.
    pub node: Contact,
    /// Correlation token.
    pub rpc_id: RpcId,
    /// Request or response payload.
    pub body: Body,
}

impl Envelope {
    /// Build a REQUEST with a fresh correlation token.
    pub fn request(node: Contact, request: Request) -> Self {
        Self {
            node,
            rpc_id: RpcId::random(),
            body: Body::Request(request),
        }
    }

    /// Build the RESPONSE to the request carrying `rpc_id`.
    pub fn response(node: Contact, rpc_id: RpcId, result: RpcResult) -> Self {
        Self {
            node,
            rpc_id,
            body: Body::Response(result),
        }
    }

    /// Encode to a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PayloadTooLarge`] if the encoding exceeds
    /// [`MAX_DATAGRAM_SIZE`]. Nothing is truncated.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = cbor::to_vec(&self.to_wire())?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Encode a `node_list` response, dropping the farthest contacts until the
    /// envelope fits in one datagram. Other envelopes encode as [`encode`](Self::encode).
    pub fn encode_trimmed(mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.encode() {
                Err(TransportError::PayloadTooLarge { size, .. }) => {
                    let Body::Response(RpcResult::NodeList(contacts)) = &mut self.body else {
                        return Err(TransportError::PayloadTooLarge {
                            size,
                            max: MAX_DATAGRAM_SIZE,
                        });
                    };
                    if contacts.pop().is_none() {
                        return Err(TransportError::PayloadTooLarge {
                            size,
                            max: MAX_DATAGRAM_SIZE,
                        });
                    }
                }
                other => return other,
            }
        }
    }

    /// Decode a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Deserialization`] for malformed payloads:
    /// invalid CBOR, missing members, or arguments that do not match a known
    /// command. An unknown command string is not an error; it decodes to
    /// [`Request::Unrecognized`].
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Deserialization(format!(
                "datagram of {} bytes exceeds {MAX_DATAGRAM_SIZE}",
                data.len()
            )));
        }
        let raw: RawEnvelope = cbor::from_slice(data)?;
        Self::from_raw(raw)
    }

    /// Returns `true` for REQUEST envelopes.
    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request(_))
    }

    fn to_wire(&self) -> OutEnvelope<'_> {
        let mut out = OutEnvelope {
            node: &self.node,
            kind: Direction::Request,
            rpc_id: self.rpc_id,
            command: None,
            arg: None,
            request_rpc_id: None,
            result_type: None,
            result: None,
        };
        match &self.body {
            Body::Request(request) => {
                out.command = Some(request.command());
                out.arg = Some(match request {
                    Request::Ping(a) => Payload::Ping(a),
                    Request::FindNode(a) => Payload::FindNode(a),
                    Request::FindValue(a) => Payload::FindValue(a),
                    Request::Store(a) => Payload::Store(a),
                    Request::Unrecognized { .. } => Payload::Empty(EmptyArgs {}),
                });
            }
            Body::Response(result) => {
                out.kind = Direction::Response;
                out.request_rpc_id = Some(self.rpc_id);
                out.result_type = Some(result.result_type());
                out.result = Some(match result {
                    RpcResult::NodeList(contacts) => Payload::Contacts(contacts),
                    RpcResult::Value(bytes) => Payload::Text(STANDARD.encode(bytes)),
                    RpcResult::SeqValue(seq) => Payload::Integer(*seq),
                    RpcResult::SuccessBoolean(ok) => Payload::Bool(*ok),
                    RpcResult::Error(message) => Payload::Text(message.clone()),
                });
            }
        }
        out
    }

    fn from_raw(raw: RawEnvelope) -> Result<Self, TransportError> {
        match raw.kind {
            Direction::Request => {
                let command = raw.command.ok_or_else(|| missing("command"))?;
                let arg = raw.arg.unwrap_or(Value::Null);
                let request = match command.as_str() {
                    CMD_PING => Request::Ping(cbor::from_value::<PingArgs>(&arg, CMD_PING)?),
                    CMD_FIND_NODE => {
                        Request::FindNode(cbor::from_value::<FindNodeArgs>(&arg, CMD_FIND_NODE)?)
                    }
                    CMD_FIND_VALUE => Request::FindValue(cbor::from_value::<FindValueArgs>(
                        &arg,
                        CMD_FIND_VALUE,
                    )?),
                    CMD_STORE => Request::Store(cbor::from_value::<StoreArgs>(&arg, CMD_STORE)?),
                    _ => Request::Unrecognized { command },
                };
                Ok(Self {
                    node: raw.node,
                    rpc_id: raw.rpc_id,
                    body: Body::Request(request),
                })
            }
            Direction::Response => {
                let result_type = raw.result_type.ok_or_else(|| missing("result_type"))?;
                let value = raw.result.ok_or_else(|| missing("result"))?;
                let result = match result_type.as_str() {
                    RESULT_NODE_LIST => {
                        RpcResult::NodeList(cbor::from_value(&value, RESULT_NODE_LIST)?)
                    }
                    RESULT_VALUE => {
                        let text: String = cbor::from_value(&value, RESULT_VALUE)?;
                        let bytes = STANDARD
                            .decode(text)
                            .map_err(|e| TransportError::Deserialization(format!("value: {e}")))?;
                        RpcResult::Value(bytes)
                    }
                    RESULT_SEQ_VALUE => {
                        RpcResult::SeqValue(cbor::from_value(&value, RESULT_SEQ_VALUE)?)
                    }
                    RESULT_SUCCESS_BOOLEAN => RpcResult::SuccessBoolean(cbor::from_value(
                        &value,
                        RESULT_SUCCESS_BOOLEAN,
                    )?),
                    RESULT_ERROR => RpcResult::Error(cbor::from_value(&value, RESULT_ERROR)?),
                    other => {
                        return Err(TransportError::Deserialization(format!(
                            "unknown result_type {other:?}"
                        )))
                    }
                };
                Ok(Self {
                    node: raw.node,
                    rpc_id: raw.request_rpc_id.unwrap_or(raw.rpc_id),
                    body: Body::Response(result),
                })
            }
        }
    }
}

fn missing(field: &str) -> TransportError {
    TransportError::Deserialization(format!("envelope missing {field}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Direction {
    #[serde(rename = "REQUEST")]
    Request,
    #[serde(rename = "RESPONSE")]
    Response,
}

#[derive(Serialize)]
struct OutEnvelope<'a> {
    node: &'a Contact,
    #[serde(rename = "type")]
    kind: Direction,
    rpc_id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg: Option<Payload<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_rpc_id: Option<RpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Payload<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Ping(&'a PingArgs),
    FindNode(&'a FindNodeArgs),
    FindValue(&'a FindValueArgs),
    Store(&'a StoreArgs),
    Empty(EmptyArgs),
    Contacts(&'a [Contact]),
    Text(String),
    Integer(u64),
    Bool(bool),
}

#[derive(Serialize)]
struct EmptyArgs {}

#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    node: Contact,
    #[serde(rename = "type")]
    kind: Direction,
    rpc_id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arg: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_rpc_id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use arxen_types::NodeId;
    use std::net::SocketAddr;

    fn sender() -> Contact {
        Contact::new(NodeId::random(), SocketAddr::from(([10, 0, 0, 1], 55667)))
    }

    fn assert_roundtrip(envelope: Envelope) {
        let bytes = envelope.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.node.addr, envelope.node.addr);
    }

    #[test]
    fn test_request_roundtrip() {
        let node = sender();
        assert_roundtrip(Envelope::request(
            node,
            Request::Ping(PingArgs { seq_value: 77 }),
        ));
        assert_roundtrip(Envelope::request(node, Request::find_node(NodeId::random())));
        assert_roundtrip(Envelope::request(node, Request::find_value(NodeId::from(42))));
        assert_roundtrip(Envelope::request(
            node,
            Request::Store(StoreArgs {
                value_id: NodeId::from(42),
                data: b"hello".to_vec(),
            }),
        ));
    }

    #[test]
    fn test_response_roundtrip() {
        let node = sender();
        let rpc_id = RpcId::random();
        let contacts: Vec<Contact> = (0..5).map(|_| sender()).collect();
        assert_roundtrip(Envelope::response(node, rpc_id, RpcResult::NodeList(contacts)));
        assert_roundtrip(Envelope::response(node, rpc_id, RpcResult::Value(vec![0, 1, 255])));
        assert_roundtrip(Envelope::response(node, rpc_id, RpcResult::SeqValue(u64::MAX)));
        assert_roundtrip(Envelope::response(node, rpc_id, RpcResult::SuccessBoolean(false)));
        assert_roundtrip(Envelope::response(
            node,
            rpc_id,
            RpcResult::Error("unrecognized command".into()),
        ));
    }

    #[test]
    fn test_unknown_command_decodes_as_unrecognized() {
        let envelope = Envelope::request(
            sender(),
            Request::Unrecognized {
                command: "GOSSIP".into(),
            },
        );
        let bytes = envelope.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(
            decoded.body,
            Body::Request(Request::Unrecognized {
                command: "GOSSIP".into()
            })
        );
    }

    #[test]
    fn test_known_command_with_bad_arg_is_rejected() {
        let raw = RawEnvelope {
            node: sender(),
            kind: Direction::Request,
            rpc_id: RpcId(1),
            command: Some(CMD_FIND_NODE.into()),
            arg: Some(Value::Text("nope".into())),
            request_rpc_id: None,
            result_type: None,
            result: None,
        };
        let bytes = cbor::to_vec(&raw).expect("encode");
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(TransportError::Deserialization(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Envelope::decode(b"definitely not cbor").is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn test_oversized_store_fails() {
        let envelope = Envelope::request(
            sender(),
            Request::Store(StoreArgs {
                value_id: NodeId::random(),
                data: vec![7u8; MAX_DATAGRAM_SIZE],
            }),
        );
        assert!(matches!(
            envelope.encode(),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        assert!(envelope.encode_trimmed().is_err());
    }

    #[test]
    fn test_full_ipv4_node_list_fits() {
        let contacts: Vec<Contact> = (0..20).map(|_| sender()).collect();
        let envelope = Envelope::response(sender(), RpcId::random(), RpcResult::NodeList(contacts));
        let bytes = envelope.encode().expect("20 IPv4 contacts fit one datagram");
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_trimmed_node_list_keeps_nearest_prefix() {
        let contacts: Vec<Contact> = (0..40)
            .map(|i| {
                Contact::new(
                    NodeId::random(),
                    format!("[2001:db8::{i:x}]:55667").parse().expect("addr"),
                )
            })
            .collect();
        let envelope = Envelope::response(
            sender(),
            RpcId::random(),
            RpcResult::NodeList(contacts.clone()),
        );
        assert!(envelope.encode().is_err());

        let bytes = envelope.encode_trimmed().expect("trimmed");
        let decoded = Envelope::decode(&bytes).expect("decode");
        let kept = match decoded.body {
            Body::Response(RpcResult::NodeList(kept)) => kept,
            _ => Vec::new(),
        };
        assert!(!kept.is_empty());
        assert!(kept.len() < contacts.len());
        assert_eq!(kept[..], contacts[..kept.len()]);
    }

    #[test]
    fn test_largest_value_fits_from_ipv6_sender() {
        let node = Contact::new(
            NodeId::random(),
            "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535"
                .parse()
                .expect("addr"),
        );
        let response = Envelope::response(
            node,
            RpcId(u64::MAX),
            RpcResult::Value(vec![0xab; MAX_VALUE_SIZE]),
        );
        let bytes = response.encode().expect("largest value fits");
        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);

        let too_big = Envelope::response(node, RpcId(1), RpcResult::Value(vec![0xab; 1200]));
        assert!(matches!(
            too_big.encode_trimmed(),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_response_reuses_request_id() {
        let request = Envelope::request(sender(), Request::find_node(NodeId::random()));
        let response = Envelope::response(sender(), request.rpc_id, RpcResult::NodeList(vec![]));
        let decoded = Envelope::decode(&response.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.rpc_id, request.rpc_id);
        assert!(!decoded.is_request());
    }
}
