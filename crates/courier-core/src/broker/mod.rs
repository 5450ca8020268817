//! Streaming store abstraction consumed by the bus.

mod memory;
mod valkey;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryBroker, RecordedReply};
pub use valkey::ValkeyBroker;

/// Errors raised by a streaming store backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Pool or network failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("backend error: {0}")]
    Backend(String),
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Broker-assigned entry id.
    pub id: String,
    /// Field map; scalar values arrive as their string bytes.
    pub fields: HashMap<String, Vec<u8>>,
}

/// Minimal streaming-store surface the bus depends on.
///
/// Backends are shared across consumer tasks and must be thread-safe.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Appends a field map to a stream, returning the assigned entry id.
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
    ) -> Result<String, BrokerError>;

    /// Blocking read of up to `count` entries appended after `last_id`.
    ///
    /// The cursor `"$"` means entries appended after this call starts.
    async fn xread(
        &self,
        stream: &str,
        last_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Delivers a reply in one pipeline: `RPUSH key payload`,
    /// `EXPIRE key ttl`, `XDEL stream entry_id`.
    async fn deliver_reply(
        &self,
        stream: &str,
        entry_id: &str,
        key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), BrokerError>;
}
