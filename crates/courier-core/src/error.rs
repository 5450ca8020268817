//! Error types for the bus.

use thiserror::Error;

use courier_proto::ProtocolError;

use crate::broker::BrokerError;

/// A typed failure produced by a handler.
///
/// Carries the symbolic class tag that travels in the reply's `error_class`
/// field alongside the human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Symbolic tag of the failure kind.
    pub class: String,
    /// Human-readable description.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error with the given class tag and message.
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Envelope or payload serialisation failed.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] ProtocolError),

    /// A handler constructor rejected the payload.
    #[error("failed to construct handler: {0}")]
    Construction(String),

    /// No constructor registered for the stream.
    #[error("no handler constructor registered for stream: {0}")]
    MissingConstructor(String),

    /// The broker rejected the append.
    #[error("failed to add message to stream: {0}")]
    Append(#[source] BrokerError),

    /// A broker read or pipeline call failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The caller's context was cancelled while waiting.
    #[error("context cancelled")]
    Cancelled,

    /// No reply arrived within the execute window.
    #[error("timeout waiting for response (request_id: {request_id})")]
    ResponseTimeout {
        /// Correlation id of the abandoned request.
        request_id: String,
    },
}
