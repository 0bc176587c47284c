//! YAML wire codec.
//!
//! Requests and results travel as YAML text: it preserves nulls, booleans,
//! signed integers, strings, sequences, and string-keyed mappings, and stays
//! readable in broker tooling. Codec failures never escape as errors to a
//! remote peer; callers translate them into the reserved status codes.

use serde::Serialize;
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("could not serialize payload as YAML: {source}")]
    Encode {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("could not parse payload as YAML: {source}")]
    Decode {
        #[source]
        source: serde_yaml::Error,
    },
}

/// Serializes `value` to YAML text.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_yaml::to_string(value).map_err(|source| CodecError::Encode { source })
}

/// Parses a raw message body into a generic YAML value.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    serde_yaml::from_slice(bytes).map_err(|source| CodecError::Decode { source })
}
