//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `handoff:requests`, one entry per accepted request
//! - **Consumer group**: `handoff.workers`; every worker process joins it under its own name
//! - **Visibility**: an entry idle in the pending list longer than the visibility
//!   timeout is reclaimed with `XCLAIM` by the next `receive`
//! - **Dead-letter stream**: `handoff:requests:dlq`, fed when the delivery count
//!   reaches `max_receive_count`
//!
//! Streams have no native delayed redelivery. `retry_later` re-claims the entry
//! with a back-dated `IDLE`, so it becomes reclaimable after `delay` (at most
//! the visibility timeout).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{instrument, warn};

use handoff_core::MessageId;

use super::types::{DeadLetterEntry, Delivery, QueueConfig, QueueMessage, Receipt};
use super::work_queue::{QueueError, WorkQueue};

/// Default stream key for accepted requests.
pub const DEFAULT_STREAM_KEY: &str = "handoff:requests";

/// Default dead-letter stream key.
pub const DEFAULT_DLQ_KEY: &str = "handoff:requests:dlq";

/// Default consumer group.
pub const DEFAULT_GROUP: &str = "handoff.workers";

#[derive(Clone)]
pub struct RedisStreamsWorkQueue {
    conn: ConnectionManager,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    config: QueueConfig,
}

impl core::fmt::Debug for RedisStreamsWorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsWorkQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

/// One raw stream entry: id plus its field map.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl RedisStreamsWorkQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// `consumer` must be unique per worker process (e.g. host name plus pid).
    pub async fn connect(
        redis_url: &str,
        consumer: impl Into<String>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(broker_err("open"))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(broker_err("connect"))?;

        let queue = Self {
            conn,
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            config,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// Override the stream keys (e.g. one stream per environment).
    pub fn with_keys(mut self, stream_key: impl Into<String>, dlq_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.dlq_key = dlq_key.into();
        self
    }

    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        // BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Broker(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn visibility_ms(&self) -> u64 {
        self.config.visibility_timeout.as_millis() as u64
    }

    /// Reclaim entries whose holder let the visibility timeout lapse.
    async fn reclaim_expired(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();

        // XPENDING <stream> <group> IDLE <ms> - + <count> -> [id, consumer, idle_ms, deliveries]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XPENDING"))?;

        let mut deliveries = Vec::new();
        for (id, _owner, _idle, delivered) in pending {
            let claimed: redis::Value = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(self.visibility_ms())
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(broker_err("XCLAIM"))?;

            // Another consumer got there first, or the entry was deleted.
            let Some(entry) = parse_entries(claimed).into_iter().next() else {
                continue;
            };

            let delivered = u32::try_from(delivered).unwrap_or(u32::MAX);
            let message = match decode_message(&entry) {
                Ok(m) => m,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "dropping undecodable stream entry");
                    self.delete_entry(&entry.id).await?;
                    continue;
                }
            };

            if delivered >= self.config.max_receive_count {
                self.dead_letter(&entry.id, message, delivered).await?;
                continue;
            }

            deliveries.push(Delivery {
                receipt: Receipt(entry.id),
                message,
                receive_count: delivered.saturating_add(1),
            });
        }

        Ok(deliveries)
    }

    async fn read_new(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XREADGROUP"))?;

        // Reply: [[stream_key, [entry, ...]]] or nil when nothing is new.
        let redis::Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for stream in streams {
            let redis::Value::Bulk(mut parts) = stream else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            for entry in parse_entries(parts.swap_remove(1)) {
                match decode_message(&entry) {
                    Ok(message) => deliveries.push(Delivery {
                        receipt: Receipt(entry.id),
                        message,
                        receive_count: 1,
                    }),
                    Err(e) => {
                        warn!(entry_id = %entry.id, error = %e, "dropping undecodable stream entry");
                        self.delete_entry(&entry.id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn delete_entry(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XACK"))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XDEL"))?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(request_id = %message.request_id), err)]
    async fn dead_letter(
        &self,
        entry_id: &str,
        message: QueueMessage,
        receive_count: u32,
    ) -> Result<(), QueueError> {
        let entry = DeadLetterEntry::new(message, receive_count, "max receive count exceeded");
        let payload = serde_json::to_string(&entry)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("message_id")
            .arg(entry.message.message_id.to_string())
            .arg("entry")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("DLQ XADD"))?;

        self.delete_entry(entry_id).await?;

        warn!(
            message_id = %entry.message.message_id,
            receive_count,
            "message sent to dead-letter stream"
        );
        Ok(())
    }

    async fn dead_letter_entries(&self, count: Option<usize>) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&self.dlq_key).arg("-").arg("+");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let reply: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XRANGE"))?;
        Ok(parse_entries(reply))
    }
}

#[async_trait]
impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(skip(self, message), fields(request_id = %message.request_id), err)]
    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("message_id")
            .arg(message.message_id.to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XADD"))?;

        Ok(message.message_id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut deliveries = self.reclaim_expired(max).await?;
        if deliveries.len() < max {
            deliveries.extend(self.read_new(max - deliveries.len()).await?);
        }
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        self.delete_entry(receipt.as_str()).await
    }

    async fn retry_later(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        let delay_ms = delay.as_millis() as u64;
        let idle_ms = self.visibility_ms().saturating_sub(delay_ms);

        let mut conn = self.conn.clone();
        // JUSTID keeps the delivery counter unchanged.
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(receipt.as_str())
            .arg("IDLE")
            .arg(idle_ms)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(broker_err("XCLAIM"))?;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.dead_letter_entries(Some(limit))
            .await?
            .iter()
            .map(decode_dead_letter)
            .collect()
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let wanted = message_id.to_string();
        let entries = self.dead_letter_entries(None).await?;
        let found = entries
            .iter()
            .find(|e| e.fields.get("message_id") == Some(&wanted))
            .ok_or(QueueError::NotFound(*message_id))?;

        let dead = decode_dead_letter(found)?;
        self.send(dead.message).await?;

        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.dlq_key)
            .arg(&found.id)
            .query_async(&mut conn)
            .await
            .map_err(broker_err("DLQ XDEL"))?;
        Ok(())
    }
}

fn broker_err(op: &'static str) -> impl Fn(redis::RedisError) -> QueueError {
    move |e| QueueError::Broker(format!("{op} failed: {e}"))
}

fn decode_message(entry: &StreamEntry) -> Result<QueueMessage, QueueError> {
    let payload = entry
        .fields
        .get("payload")
        .ok_or_else(|| QueueError::Serialization("missing payload field".to_string()))?;
    serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode_dead_letter(entry: &StreamEntry) -> Result<DeadLetterEntry, QueueError> {
    let raw = entry
        .fields
        .get("entry")
        .ok_or_else(|| QueueError::Serialization("missing entry field".to_string()))?;
    serde_json::from_str(raw).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Parse `[[id, [k, v, ...]], ...]`. Entries with a nil field list (deleted
/// while pending) are skipped.
fn parse_entries(value: redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(items) = value else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let redis::Value::Bulk(parts) = item else {
                return None;
            };
            let mut parts = parts.into_iter();
            let id = match parts.next()? {
                redis::Value::Data(d) => String::from_utf8_lossy(&d).into_owned(),
                redis::Value::Status(s) => s,
                _ => return None,
            };
            let redis::Value::Bulk(raw_fields) = parts.next()? else {
                return None;
            };

            let mut fields = HashMap::new();
            for pair in raw_fields.chunks(2) {
                if let [redis::Value::Data(k), redis::Value::Data(v)] = pair {
                    fields.insert(
                        String::from_utf8_lossy(k).into_owned(),
                        String::from_utf8_lossy(v).into_owned(),
                    );
                }
            }
            Some(StreamEntry { id, fields })
        })
        .collect()
}
