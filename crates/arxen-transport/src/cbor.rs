//! CBOR serialization helpers for the Arxen wire protocol.
//!
//! Wraps [`ciborium`]. Envelopes are encoded with [`to_vec`]. On the way in,
//! the command-specific `arg` and `result` members are first read as untyped
//! [`ciborium::Value`]s and converted with [`from_value`] once the command
//! or result type is known.

use ciborium::Value;
use serde::{de::DeserializeOwned, Serialize};

use crate::TransportError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| {
        TransportError::Serialization(format!("CBOR serialization failed: {e}"))
    })?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`TransportError::Deserialization`] if the bytes cannot be deserialized
/// into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data).map_err(|e| {
        TransportError::Deserialization(format!("CBOR deserialization failed: {e}"))
    })
}

/// Interpret an untyped CBOR [`Value`] as `T`.
pub fn from_value<T: DeserializeOwned>(value: &Value, type_name: &str) -> Result<T, TransportError> {
    value.deserialized().map_err(|e| {
        TransportError::Deserialization(format!(
            "CBOR deserialization of {type_name} failed: {e}"
        ))
    })
}
