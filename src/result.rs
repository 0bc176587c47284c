//! Uniform result envelope carried on the wire by every operation.
//!
//! Every request, whether it fans out to a dozen backends or dies in the
//! transport layer, resolves to a [`CallResult`]: a numeric status (0 for
//! success, greater than zero for error) plus a free-form response payload.
//! The wire form is the mapping `{status, response}`.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Reserved status codes for errors raised by the bus itself. Backend
/// managers report domain failures with their own non-zero statuses.
pub mod status {
    /// Envelope is not a mapping, or names no `action`.
    pub const MALFORMED_ENVELOPE: i64 = 450;
    /// The handler exposes no action with the requested name.
    pub const UNKNOWN_ACTION: i64 = 451;
    /// A declared parameter of the action is absent from the envelope.
    pub const MISSING_PARAMETER: i64 = 452;
    /// The outgoing payload could not be serialized.
    pub const ENCODE_FAILED: i64 = 453;
    /// An RPC reply could not be deserialized.
    pub const DECODE_FAILED: i64 = 454;
    /// The handler returned an error instead of a result.
    pub const HANDLER_FAILED: i64 = 455;
    /// Delivery to the broker failed, or a write was refused in
    /// read-only mode.
    pub const DELIVERY_FAILED: i64 = 470;
    /// No reply arrived within the RPC deadline.
    pub const RPC_TIMEOUT: i64 = 471;
}

/// Error produced when a wire value does not have the `{status, response}`
/// shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("wire value is not a mapping")]
    NotAMapping,
    #[error("wire mapping has no integer `status` key")]
    MissingStatus,
    #[error("wire mapping has no `response` key")]
    MissingResponse,
}

/// Status plus payload for a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// 0 for success; >0 for error.
    pub status: i64,
    /// Payload: null, scalar, sequence, or string-keyed mapping.
    pub response: Value,
}

impl CallResult {
    pub fn new(status: i64, response: Value) -> Self {
        Self { status, response }
    }

    /// Successful result carrying `response`.
    pub fn ok(response: Value) -> Self {
        Self::new(0, response)
    }

    /// Error result whose payload is a human-readable message.
    pub fn error(status: i64, message: &str) -> Self {
        Self::new(status, Value::String(message.to_owned()))
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// Wraps the result as the `{status, response}` mapping used on the wire.
    pub fn to_wire(&self) -> Value {
        let mut map = Mapping::new();
        map.insert(
            Value::String("status".to_owned()),
            Value::Number(self.status.into()),
        );
        map.insert(Value::String("response".to_owned()), self.response.clone());
        Value::Mapping(map)
    }

    /// Rebuilds a result from its wire mapping.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        let map = value.as_mapping().ok_or(WireError::NotAMapping)?;
        let status = map
            .get("status")
            .and_then(Value::as_i64)
            .ok_or(WireError::MissingStatus)?;
        let response = map.get("response").ok_or(WireError::MissingResponse)?;
        Ok(Self::new(status, response.clone()))
    }
}
