//! Redis Streams implementation of the stream bus.
//!
//! Publishing appends with XADD; subscribing uses consumer groups
//! (XGROUP CREATE MKSTREAM / XREADGROUP / XACK). Each record carries the
//! core envelope fields plus metadata entries under a `meta:` prefix so
//! metadata round-trips losslessly.
//!
//! Each subscriber loop opens its own connection: XREADGROUP with BLOCK
//! would otherwise stall every command sharing the multiplexed connection.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::domain::foundation::{EventId, Timestamp};
use crate::ports::{BusError, Message, MessageHandler, StreamPublisher, StreamSubscriber};

const FIELD_ID: &str = "id";
const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_OCCURRED_AT: &str = "occurred_at";
const FIELD_PUBLISHED_AT: &str = "published_at";
const META_PREFIX: &str = "meta:";

/// Redis Streams publisher/subscriber.
#[derive(Clone)]
pub struct RedisStreamBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    read_count: usize,
    block: Duration,
}

impl RedisStreamBus {
    /// Connects the shared publishing connection.
    pub async fn connect(client: redis::Client) -> Result<Self, BusError> {
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            read_count: 16,
            block: Duration::from_secs(2),
        })
    }

    /// Maximum messages fetched per blocking read.
    pub fn with_read_count(mut self, count: usize) -> Self {
        self.read_count = count;
        self
    }

    /// Maximum wait for a blocking read when no messages are available.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Creates the consumer group if absent. A BUSYGROUP response means
    /// another instance won the creation race; that is not an error.
    async fn ensure_group(
        conn: &mut MultiplexedConnection,
        topic: &str,
        group: &str,
    ) -> Result<(), BusError> {
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::GroupCreate(e.to_string())),
        }
    }

    async fn deliver_batch(
        conn: &mut MultiplexedConnection,
        topic: &str,
        group: &str,
        reply: StreamReadReply,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let message = match decode_entry(topic, &entry.map) {
                    Ok(message) => message,
                    Err(e) => {
                        // Left unacked: a malformed record is visible in the
                        // pending list for operators instead of vanishing.
                        tracing::warn!(topic, entry_id = %entry.id, error = %e, "skipping malformed stream record");
                        continue;
                    }
                };

                match handler.handle(message).await {
                    Ok(()) => {
                        conn.xack::<_, _, _, ()>(topic, group, &[&entry.id])
                            .await
                            .map_err(|e| BusError::Consume(e.to_string()))?;
                    }
                    Err(e) => {
                        // No ack: the entry stays pending and is a
                        // redelivery candidate.
                        tracing::warn!(
                            topic,
                            handler = handler.name(),
                            entry_id = %entry.id,
                            error = %e,
                            "handler failed; message left unacknowledged"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl StreamPublisher for RedisStreamBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let fields = encode_message(message, Timestamp::now());
        let mut conn = self.conn.clone();

        // XADD returns the generated entry id once the broker accepted the
        // record; we only need the acknowledgment.
        let _entry_id: String = conn
            .xadd(&message.topic, "*", &fields)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl StreamSubscriber for RedisStreamBus {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        // Dedicated connection: BLOCK must not stall the publisher.
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Self::ensure_group(&mut conn, topic, group).await?;

        // Crash recovery: first drain this consumer's own pending entries
        // (delivered before a previous crash but never acknowledged), then
        // switch to blocking reads of new messages. The recovery cursor
        // advances past each batch so an entry whose handler still fails is
        // visited once, not spun on.
        let mut recovery_cursor: Option<String> = Some("0".to_string());

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let opts = match recovery_cursor {
                Some(_) => StreamReadOptions::default()
                    .group(group, consumer)
                    .count(self.read_count),
                None => StreamReadOptions::default()
                    .group(group, consumer)
                    .count(self.read_count)
                    .block(self.block.as_millis() as usize),
            };
            let start_id = recovery_cursor.clone().unwrap_or_else(|| ">".to_string());
            let keys = [topic];
            let ids = [start_id.as_str()];

            // The read future borrows the connection; deliver only after the
            // select has dropped it.
            let reply = tokio::select! {
                _ = shutdown.changed() => continue,

                reply = conn.xread_options::<_, _, StreamReadReply>(
                    &keys,
                    &ids,
                    &opts,
                ) => reply.map_err(|e| BusError::Consume(e.to_string()))?,
            };

            if recovery_cursor.is_some() {
                recovery_cursor = reply
                    .keys
                    .iter()
                    .flat_map(|k| k.ids.iter())
                    .last()
                    .map(|entry| entry.id.clone());
            }

            Self::deliver_batch(&mut conn, topic, group, reply, &handler).await?;
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Wire format
// ════════════════════════════════════════════════════════════════════════════

fn encode_message(message: &Message, published_at: Timestamp) -> Vec<(String, Vec<u8>)> {
    let mut fields: Vec<(String, Vec<u8>)> = vec![
        (FIELD_ID.into(), message.id.as_str().as_bytes().to_vec()),
        (FIELD_PAYLOAD.into(), message.payload.clone()),
        (
            FIELD_OCCURRED_AT.into(),
            message.occurred_at.as_unix_millis().to_string().into_bytes(),
        ),
        (
            FIELD_PUBLISHED_AT.into(),
            published_at.as_unix_millis().to_string().into_bytes(),
        ),
    ];

    if let Some(key) = &message.key {
        fields.push((FIELD_KEY.into(), key.as_bytes().to_vec()));
    }

    for (k, v) in &message.metadata {
        fields.push((format!("{META_PREFIX}{k}"), v.as_bytes().to_vec()));
    }

    fields
}

fn decode_entry(topic: &str, map: &HashMap<String, redis::Value>) -> Result<Message, BusError> {
    let mut message = Message::new(
        topic,
        EventId::from_string(required_string(map, FIELD_ID)?),
        required_bytes(map, FIELD_PAYLOAD)?,
    );

    message.occurred_at = Timestamp::from_unix_millis(required_millis(map, FIELD_OCCURRED_AT)?);
    message.published_at = Some(Timestamp::from_unix_millis(required_millis(
        map,
        FIELD_PUBLISHED_AT,
    )?));

    if let Some(value) = map.get(FIELD_KEY) {
        message.key = Some(value_to_string(FIELD_KEY, value)?);
    }

    for (field, value) in map {
        if let Some(meta_key) = field.strip_prefix(META_PREFIX) {
            message
                .metadata
                .insert(meta_key.to_string(), value_to_string(field, value)?);
        }
    }

    Ok(message)
}

fn required_bytes(map: &HashMap<String, redis::Value>, field: &str) -> Result<Vec<u8>, BusError> {
    let value = map
        .get(field)
        .ok_or_else(|| BusError::Decode(format!("missing field: {}", field)))?;
    redis::from_redis_value(value)
        .map_err(|e| BusError::Decode(format!("field {}: {}", field, e)))
}

fn required_string(map: &HashMap<String, redis::Value>, field: &str) -> Result<String, BusError> {
    let value = map
        .get(field)
        .ok_or_else(|| BusError::Decode(format!("missing field: {}", field)))?;
    value_to_string(field, value)
}

fn required_millis(map: &HashMap<String, redis::Value>, field: &str) -> Result<i64, BusError> {
    required_string(map, field)?
        .parse()
        .map_err(|e| BusError::Decode(format!("field {}: {}", field, e)))
}

fn value_to_string(field: &str, value: &redis::Value) -> Result<String, BusError> {
    redis::from_redis_value(value)
        .map_err(|e| BusError::Decode(format!("field {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{META_AGGREGATE_ID, META_AGGREGATE_TYPE};

    fn roundtrip(message: &Message) -> Message {
        let fields = encode_message(message, Timestamp::from_unix_millis(42_000));
        let map: HashMap<String, redis::Value> = fields
            .into_iter()
            .map(|(k, v)| (k, redis::Value::Data(v)))
            .collect();
        decode_entry(&message.topic, &map).unwrap()
    }

    #[test]
    fn wire_format_round_trips_core_fields() {
        let message = Message::new(
            "submission.judged",
            EventId::from_string("evt-wire-1"),
            br#"{"verdict":"AC"}"#.to_vec(),
        )
        .with_key("sub-7")
        .with_occurred_at(Timestamp::from_unix_millis(41_000));

        let decoded = roundtrip(&message);

        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.key.as_deref(), Some("sub-7"));
        assert_eq!(decoded.occurred_at, message.occurred_at);
        assert_eq!(
            decoded.published_at,
            Some(Timestamp::from_unix_millis(42_000))
        );
    }

    #[test]
    fn metadata_round_trips_losslessly() {
        let message = Message::new("t", EventId::from_string("evt-wire-2"), vec![0, 159, 146])
            .with_metadata(META_AGGREGATE_ID, "sub-7")
            .with_metadata(META_AGGREGATE_TYPE, "Submission")
            .with_metadata("trace_id", "abc-123");

        let decoded = roundtrip(&message);

        assert_eq!(decoded.metadata, message.metadata);
        // Metadata keys never leak into core fields.
        assert_eq!(decoded.payload, vec![0, 159, 146]);
    }

    #[test]
    fn decode_rejects_missing_payload() {
        let mut map = HashMap::new();
        map.insert(
            FIELD_ID.to_string(),
            redis::Value::Data(b"evt-1".to_vec()),
        );

        let result = decode_entry("t", &map);
        assert!(matches!(result, Err(BusError::Decode(_))));
    }
}
