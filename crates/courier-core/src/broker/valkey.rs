//! Valkey/Redis streaming store backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::StreamReadReply;

use super::{BrokerError, StreamBroker, StreamEntry};

/// Valkey/Redis backend over a connection pool.
#[derive(Clone)]
pub struct ValkeyBroker {
    pool: Pool,
}

impl ValkeyBroker {
    /// Connects to the store and verifies the connection with a PING.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, BrokerError> {
        let config = Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        // Test the connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StreamBroker for ValkeyBroker {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, Vec<u8>)],
    ) -> Result<String, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }

        cmd.query_async::<String>(&mut *conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }

    async fn xread(
        &self,
        stream: &str,
        last_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        // BLOCK 0 parks the connection until an entry arrives.
        let reply: StreamReadReply = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(0)
            .arg("STREAMS")
            .arg(stream)
            .arg(last_id)
            .query_async(&mut *conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (field, value) in id.map {
                    let bytes: Vec<u8> = redis::from_redis_value(&value)
                        .map_err(|e| BrokerError::Backend(e.to_string()))?;
                    fields.insert(field, bytes);
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn deliver_reply(
        &self,
        stream: &str,
        entry_id: &str,
        key: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        redis::pipe()
            .cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .ignore()
            .cmd("XDEL")
            .arg(stream)
            .arg(entry_id)
            .ignore()
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }
}

impl std::fmt::Debug for ValkeyBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyBroker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require a running Valkey/Redis instance.

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn append_and_read() {
        let broker = ValkeyBroker::connect("redis://127.0.0.1:6379", 5)
            .await
            .expect("failed to connect to Valkey");

        let stream = "courier.test.append_and_read";
        let fields = vec![("i".to_owned(), b"abcd".to_vec())];

        let reader = {
            let broker = broker.clone();
            let stream = stream.to_owned();
            tokio::spawn(async move { broker.xread(&stream, "$", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entry_id = broker.xadd(stream, &fields).await.expect("xadd");

        let entries = reader.await.expect("task").expect("xread");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
        assert_eq!(entries[0].fields.get("i"), Some(&b"abcd".to_vec()));
    }

    #[tokio::test]
    #[ignore = "requires Valkey/Redis instance at 127.0.0.1:6379"]
    async fn reply_pipeline_sets_ttl_and_deletes_entry() {
        let broker = ValkeyBroker::connect("redis://127.0.0.1:6379", 5)
            .await
            .expect("failed to connect to Valkey");

        let stream = "courier.test.reply_pipeline";
        let entry_id = broker
            .xadd(stream, &[("i".to_owned(), b"efgh".to_vec())])
            .await
            .expect("xadd");

        broker
            .deliver_reply(stream, &entry_id, "efgh", b"reply", Duration::from_secs(30))
            .await
            .expect("deliver_reply");

        let mut conn = broker.pool.get().await.expect("pool");
        let ttl: i64 = redis::cmd("TTL")
            .arg("efgh")
            .query_async(&mut *conn)
            .await
            .expect("ttl");
        assert!(ttl > 0 && ttl <= 30);

        let len: usize = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut *conn)
            .await
            .expect("xlen");
        assert_eq!(len, 0);
    }
}
