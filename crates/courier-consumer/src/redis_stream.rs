//! Redis Streams broker.
//!
//! Messages are stream entries with a `payload` field and an optional
//! `routing_key` field, read through a consumer group. `ack` is `XACK`.
//! `nack` re-appends the entry marked as redelivered and acknowledges the
//! original, so the retry goes to whichever group member reads it next.
//!
//! On start the broker first drains entries already assigned to this
//! consumer name but never acknowledged, which recovers messages that were
//! in flight when the previous process stopped. The backlog is walked once,
//! in id order; entries handed out during recovery are never read again.
//!
//! Blocking reads use their own connection so acks and requeues are not
//! queued behind them.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands, RedisResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    broker::{BrokerMessage, MessageBroker},
    error::Result,
};

const PAYLOAD_FIELD: &str = "payload";
const ROUTING_KEY_FIELD: &str = "routing_key";
const REDELIVERED_FIELD: &str = "redelivered";

/// Connection and consumer-group settings.
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL.
    pub url: String,
    /// Stream key events are published to.
    pub stream: String,
    /// Consumer group shared by all courier instances.
    pub group: String,
    /// This instance's consumer name within the group.
    pub consumer: String,
    /// Maximum entries fetched per read.
    pub batch_size: usize,
    /// How long one blocking read waits for new entries.
    pub block: Duration,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream: "courier:events".to_string(),
            group: "courier".to_string(),
            consumer: "courier-1".to_string(),
            batch_size: 10,
            block: Duration::from_secs(5),
        }
    }
}

/// Where the next group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Pending entries of this consumer with an id above the given one.
    Backlog(String),
    /// Entries never delivered to any consumer (`>`).
    New,
}

impl ReadCursor {
    fn start() -> Self {
        Self::Backlog("0".to_string())
    }

    fn start_id(&self) -> &str {
        match self {
            Self::Backlog(after) => after,
            Self::New => ">",
        }
    }

    fn is_backlog(&self) -> bool {
        matches!(self, Self::Backlog(_))
    }

    /// Moves past a batch read at this cursor. An empty backlog batch ends
    /// recovery.
    fn advance(&mut self, batch: &[BrokerMessage]) {
        if self.is_backlog() {
            *self = match batch.last() {
                Some(last) => Self::Backlog(last.delivery_tag.clone()),
                None => Self::New,
            };
        }
    }
}

#[derive(Debug)]
struct ReadState {
    buffer: VecDeque<BrokerMessage>,
    cursor: ReadCursor,
}

/// [`MessageBroker`] over a Redis Streams consumer group.
pub struct RedisStreamBroker {
    connection: MultiplexedConnection,
    reader: MultiplexedConnection,
    config: RedisStreamConfig,
    state: Mutex<ReadState>,
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("stream", &self.config.stream)
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamBroker {
    /// Connects and creates the consumer group if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if the connection or group creation fails.
    pub async fn connect(config: RedisStreamConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        let reader = client.get_multiplexed_async_connection().await?;

        let created: RedisResult<()> =
            connection.xgroup_create_mkstream(&config.stream, &config.group, "$").await;
        match created {
            Ok(()) => info!(stream = %config.stream, group = %config.group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %config.stream, group = %config.group, "consumer group exists");
            },
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            connection,
            reader,
            config,
            state: Mutex::new(ReadState { buffer: VecDeque::new(), cursor: ReadCursor::start() }),
        })
    }

    /// Appends an event to the stream and returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns `Broker` if Redis rejects the write.
    pub async fn publish(&self, routing_key: Option<&str>, payload: &[u8]) -> Result<String> {
        let mut fields: Vec<(&str, &[u8])> = vec![(PAYLOAD_FIELD, payload)];
        if let Some(routing_key) = routing_key {
            fields.push((ROUTING_KEY_FIELD, routing_key.as_bytes()));
        }
        let mut connection = self.connection.clone();
        let id: String = connection.xadd(&self.config.stream, "*", &fields).await?;
        Ok(id)
    }

    async fn read(&self, start_id: &str, block: bool) -> Result<Vec<BrokerMessage>> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(self.config.batch_size);
        if block {
            options = options.block(duration_ms(self.config.block));
        }

        let mut connection = self.reader.clone();
        let reply: Option<StreamReadReply> =
            connection.xread_options(&[&self.config.stream], &[start_id], &options).await?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| to_message(&entry))
            .collect())
    }
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn receive(&self) -> Result<Option<BrokerMessage>> {
        let mut state = self.state.lock().await;
        loop {
            if let Some(message) = state.buffer.pop_front() {
                return Ok(Some(message));
            }

            let recovering = state.cursor.is_backlog();
            let batch = self.read(state.cursor.start_id(), !recovering).await?;
            if recovering {
                if batch.is_empty() {
                    info!("stream backlog recovered, reading new entries");
                } else {
                    info!(count = batch.len(), "recovering unacknowledged stream entries");
                }
            }
            state.cursor.advance(&batch);
            state.buffer.extend(batch);
        }
    }

    async fn ack(&self, message: &BrokerMessage) -> Result<()> {
        let mut connection = self.connection.clone();
        let acked: i64 = connection
            .xack(&self.config.stream, &self.config.group, &[&message.delivery_tag])
            .await?;
        if acked == 0 {
            warn!(entry_id = %message.delivery_tag, "stream entry was already acknowledged");
        }
        Ok(())
    }

    async fn nack(&self, message: &BrokerMessage) -> Result<()> {
        let mut fields: Vec<(&str, &[u8])> =
            vec![(PAYLOAD_FIELD, message.payload.as_ref()), (REDELIVERED_FIELD, b"1")];
        if let Some(routing_key) = &message.routing_key {
            fields.push((ROUTING_KEY_FIELD, routing_key.as_bytes()));
        }

        let mut connection = self.connection.clone();
        let requeued: String = connection.xadd(&self.config.stream, "*", &fields).await?;
        debug!(entry_id = %message.delivery_tag, requeued_as = %requeued, "stream entry requeued");
        self.ack(message).await
    }
}

fn to_message(entry: &StreamId) -> BrokerMessage {
    let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    BrokerMessage {
        delivery_tag: entry.id.clone(),
        routing_key: entry.get(ROUTING_KEY_FIELD),
        payload: Bytes::from(payload),
        redelivered: entry.contains_key(REDELIVERED_FIELD),
    }
}

fn duration_ms(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}
