//! Redis-backed `StateBackend` (the store of record).
//!
//! Regular commands go through one multiplexed connection. Blocking group
//! reads get a dedicated connection (a blocked multiplexed connection would
//! stall every other caller), and each pub/sub subscription owns its own
//! connection driven by a forwarding task.

use crate::backend::{StateBackend, StreamEntry, Subscription};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const SCAN_BATCH: usize = 100;
const SUBSCRIPTION_BUFFER: usize = 16;

pub struct RedisBackend {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// Dedicated connection for blocking XREADGROUP calls.
    blocking_conn: Mutex<Option<redis::aio::Connection>>,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|err| StoreError::InvalidUrl(format!("{}: {}", url, err)))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        Ok(Self {
            client,
            conn,
            blocking_conn: Mutex::new(None),
        })
    }

    fn command_error(err: redis::RedisError) -> StoreError {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

#[async_trait]
impl StateBackend for RedisBackend {
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn string_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(Self::command_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)?;
        Ok(applied > 0)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(Self::command_error)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(Self::command_error)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Dropping undecodable message on {}: {}", channel_name, err);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Subscriber dropped; tear the connection down.
                    break;
                }
            }
            debug!("Subscription to {} closed", channel_name);
        });

        Ok(Subscription::from_channel(rx))
    }

    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async(&mut conn).await.map_err(Self::command_error)
    }

    async fn group_ensure(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists: the idempotent case.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(Self::command_error(err)),
        }
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut guard = self.blocking_conn.lock().await;
        if guard.is_none() {
            let conn = self
                .client
                .get_async_connection()
                .await
                .map_err(|err| StoreError::Connection(err.to_string()))?;
            *guard = Some(conn);
        }
        let conn = guard.as_mut().expect("blocking connection just installed");

        let result: Result<Option<StreamReadReply>, redis::RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(conn)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(err) if err.code() == Some("NOGROUP") => {
                return Err(StoreError::NoGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })
            }
            Err(err) => {
                // A dead blocking connection must not wedge every later read.
                *guard = None;
                return Err(Self::command_error(err));
            }
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (field, value) in id.map {
                    match redis::from_redis_value::<String>(&value) {
                        Ok(value) => {
                            fields.insert(field, value);
                        }
                        Err(err) => {
                            warn!("Non-string field {} in entry {}: {}", field, id.id, err);
                        }
                    }
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id);
        }
        let acked: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(Self::command_error)?;
        Ok(acked.max(0) as usize)
    }
}
