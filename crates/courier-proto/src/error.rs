//! Error types for the wire protocol.

use thiserror::Error;

/// Errors raised while encoding or decoding transport envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A mandatory flat-form attribute was absent.
    #[error("attribute {0:?} not found in message data")]
    MissingAttribute(&'static str),

    /// A field carried a value of the wrong shape.
    #[error("invalid field {field:?}: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    /// The envelope was not a CBOR map.
    #[error("envelope is not a CBOR map")]
    NotAMap,

    /// CBOR serialisation failed.
    #[error("encoding error: {0}")]
    Encode(String),

    /// CBOR deserialisation failed.
    #[error("decoding error: {0}")]
    Decode(String),
}
