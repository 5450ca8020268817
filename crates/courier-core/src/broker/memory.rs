//! In-memory streaming store for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BrokerError, StreamBroker, StreamEntry};

/// A reply recorded by [`MemoryBroker::deliver_reply`].
#[derive(Debug, Clone)]
pub struct RecordedReply {
    /// Encoded reply blob.
    pub payload: Vec<u8>,
    /// Expiration requested for the reply key.
    pub ttl: Duration,
}

#[derive(Default)]
struct StreamState {
    last_seq: u64,
    entries: Vec<(u64, StreamEntry)>,
}

#[derive(Default)]
struct Shared {
    streams: HashMap<String, StreamState>,
    replies: HashMap<String, Vec<RecordedReply>>,
}

/// In-memory backend with blocking reads.
///
/// Entry ids are `<seq>-0` with a per-stream counter. Replies are recorded
/// rather than expired so tests can assert on the requested TTL.
pub struct MemoryBroker {
    shared: Mutex<Shared>,
    changes: broadcast::Sender<()>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            shared: Mutex::new(Shared::default()),
            changes,
        }
    }

    /// Replies recorded under a key, oldest first.
    #[must_use]
    pub fn replies(&self, key: &str) -> Vec<RecordedReply> {
        self.shared
            .lock()
            .expect("broker state poisoned")
            .replies
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Keys that have at least one recorded reply.
    #[must_use]
    pub fn reply_keys(&self) -> Vec<String> {
        self.shared
            .lock()
            .expect("broker state poisoned")
            .replies
            .keys()
            .cloned()
            .collect()
    }

    /// Number of entries currently held by a stream.
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.shared
            .lock()
            .expect("broker state poisoned")
            .streams
            .get(stream)
            .map_or(0, |state| state.entries.len())
    }
}

fn parse_seq(entry_id: &str) -> Result<u64, BrokerError> {
    entry_id
        .split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .ok_or_else(|| BrokerError::Backend(format!("invalid entry id: {entry_id}")))
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
    ) -> Result<String, BrokerError> {
        let id = {
            let mut shared = self.shared.lock().expect("broker state poisoned");
            let state = shared.streams.entry(stream.to_owned()).or_default();
            state.last_seq += 1;
            let id = format!("{}-0", state.last_seq);
            let entry = StreamEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            };
            state.entries.push((state.last_seq, entry));
            id
        };
        // No receivers just means nobody is blocked in xread yet.
        let _ = self.changes.send(());
        Ok(id)
    }

    async fn xread(
        &self,
        stream: &str,
        last_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        // Subscribe before the first check so an append between the check
        // and the wait is not lost.
        let mut changes = self.changes.subscribe();

        let cursor = if last_id == "$" {
            self.shared
                .lock()
                .expect("broker state poisoned")
                .streams
                .get(stream)
                .map_or(0, |state| state.last_seq)
        } else {
            parse_seq(last_id)?
        };

        loop {
            let batch: Vec<StreamEntry> = {
                let shared = self.shared.lock().expect("broker state poisoned");
                shared.streams.get(stream).map_or_else(Vec::new, |state| {
                    state
                        .entries
                        .iter()
                        .filter(|(seq, _)| *seq > cursor)
                        .take(count)
                        .map(|(_, entry)| entry.clone())
                        .collect()
                })
            };
            if !batch.is_empty() {
                return Ok(batch);
            }
            let _ = changes.recv().await;
        }
    }

    async fn deliver_reply(
        &self,
        stream: &str,
        entry_id: &str,
        key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().expect("broker state poisoned");
        shared
            .replies
            .entry(key.to_owned())
            .or_default()
            .push(RecordedReply {
                payload: payload.to_vec(),
                ttl,
            });
        if let Some(state) = shared.streams.get_mut(stream) {
            state.entries.retain(|(_, entry)| entry.id != entry_id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker").finish_non_exhaustive()
    }
}
