//! # Redis Streams Upstream
//!
//! Maps the upstream contract onto Redis Streams:
//!
//! - topic: the stream `<topic_prefix>:<channel>`
//! - subscription: a consumer group created at `$`, so it only sees entries
//!   published after it exists, and destroyed on delete
//! - delivery: one `XREADGROUP` entry; its `data` field is the payload and the
//!   millisecond part of its id is the publish time
//! - ack: `XACK`
//!
//! Each subscription owns a dedicated connection for its blocking reads; acks
//! and group management go through the shared `ConnectionManager`. The reader
//! connection's response timeout is stretched past the read block, otherwise
//! an idle `XREADGROUP BLOCK` would be reported as a failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, AsyncConnectionConfig, Client, RedisResult};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::channel::Channel;
use crate::upstream::{
    Acknowledge, Delivery, DeliveryHandler, UpstreamBroker, UpstreamError, UpstreamSubscription,
};

/// Field of a stream entry holding the JSON payload.
pub const PAYLOAD_FIELD: &str = "data";

/// Extra time a blocking read may take on top of its block duration.
pub const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    /// Connection string (e.g. "redis://127.0.0.1/").
    pub url: String,
    pub topic_prefix: String,
    pub subscription_prefix: String,
    /// Consumer name inside each group, usually the host name.
    pub consumer_name: String,
    /// How long one `XREADGROUP` blocks waiting for entries.
    pub read_block: Duration,
    /// Maximum entries per read.
    pub read_count: usize,
    /// Pause after a failed read before trying again.
    pub read_error_backoff: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            topic_prefix: "fanout".to_string(),
            subscription_prefix: "fanout-sub".to_string(),
            consumer_name: "fanout".to_string(),
            read_block: Duration::from_millis(400),
            read_count: 100,
            read_error_backoff: Duration::from_secs(1),
        }
    }
}

impl RedisStreamsConfig {
    pub fn topic_for(&self, channel: Channel) -> String {
        format!("{}:{}", self.topic_prefix, channel)
    }

    /// Response timeout of the reader connection, always longer than one
    /// blocking read.
    pub fn reader_response_timeout(&self) -> Duration {
        self.read_block + READ_TIMEOUT_MARGIN
    }
}

pub struct RedisStreamsBroker {
    client: Client,
    manager: ConnectionManager,
    config: RedisStreamsConfig,
}

impl RedisStreamsBroker {
    /// Opens the shared connection manager.
    pub async fn connect(config: RedisStreamsConfig) -> Result<Self, UpstreamError> {
        let client = Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client.clone()).await?;
        log::info!("Connected to Redis upstream at {}", config.url);
        Ok(Self { client, manager, config })
    }
}

#[async_trait]
impl UpstreamBroker for RedisStreamsBroker {
    async fn create_subscription(
        &self,
        channel: Channel,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn UpstreamSubscription>, UpstreamError> {
        let stream = self.config.topic_for(channel);
        let group = format!("{}.{}.{}", self.config.subscription_prefix, channel, Uuid::new_v4().simple());

        let mut manager = self.manager.clone();
        let _: () = manager.xgroup_create_mkstream(&stream, &group, "$").await?;

        let reader_config =
            AsyncConnectionConfig::new().set_response_timeout(Some(self.config.reader_response_timeout()));
        let reader = match self.client.get_multiplexed_async_connection_with_config(&reader_config).await {
            Ok(conn) => conn,
            Err(e) => {
                // Do not leave an orphaned group behind.
                let _: RedisResult<i64> = manager.xgroup_destroy(&stream, &group).await;
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        let reader_loop = ReadLoop {
            conn: reader,
            acks: self.manager.clone(),
            stream: stream.clone(),
            group: group.clone(),
            consumer: self.config.consumer_name.clone(),
            handler,
            token: token.clone(),
            block: self.config.read_block,
            count: self.config.read_count,
            backoff: self.config.read_error_backoff,
        };
        tokio::spawn(reader_loop.run());

        log::info!("Created consumer group {} on {}", group, stream);
        Ok(Box::new(RedisSubscription { manager, stream, group, token }))
    }
}

struct RedisSubscription {
    manager: ConnectionManager,
    stream: String,
    group: String,
    token: CancellationToken,
}

#[async_trait]
impl UpstreamSubscription for RedisSubscription {
    fn name(&self) -> &str {
        &self.group
    }

    async fn delete(&self) -> Result<(), UpstreamError> {
        let mut conn = self.manager.clone();
        let destroy = async {
            let _: i64 = conn.xgroup_destroy(&self.stream, &self.group).await?;
            Ok::<(), UpstreamError>(())
        };
        if let Err(e) = retire(&self.token, destroy).await {
            log::warn!("Destroying consumer group {} failed, reader kept running: {}", self.group, e);
            return Err(e);
        }
        log::info!("Destroyed consumer group {} on {}", self.group, self.stream);
        Ok(())
    }
}

/// Stops the reader only once the group is gone upstream.
async fn retire<F>(reader: &CancellationToken, destroy: F) -> Result<(), UpstreamError>
where
    F: Future<Output = Result<(), UpstreamError>>,
{
    destroy.await?;
    reader.cancel();
    Ok(())
}

struct StreamAck {
    conn: ConnectionManager,
    stream: String,
    group: String,
    id: String,
}

#[async_trait]
impl Acknowledge for StreamAck {
    async fn ack(&self) -> Result<(), UpstreamError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.stream, &self.group, &[&self.id]).await?;
        Ok(())
    }
}

struct ReadLoop {
    conn: MultiplexedConnection,
    acks: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    handler: Arc<dyn DeliveryHandler>,
    token: CancellationToken,
    block: Duration,
    count: usize,
    backoff: Duration,
}

impl ReadLoop {
    async fn run(mut self) {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(self.block.as_millis() as usize)
            .count(self.count);
        let keys = [self.stream.clone()];
        let ids = [">"];

        loop {
            let reply: RedisResult<Option<StreamReadReply>> = tokio::select! {
                _ = self.token.cancelled() => break,
                reply = self.conn.xread_options(&keys, &ids, &options) => reply,
            };

            match reply {
                Ok(Some(reply)) => {
                    for key in reply.keys {
                        for entry in key.ids {
                            self.deliver(entry);
                        }
                    }
                }
                // Block timeout with nothing new.
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Read from {} (group {}) failed: {}", self.stream, self.group, e);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        log::debug!("Reader for group {} stopped", self.group);
    }

    fn deliver(&self, entry: StreamId) {
        let ack = StreamAck {
            conn: self.acks.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            id: entry.id.clone(),
        };

        let Some(payload) = entry.get::<Vec<u8>>(PAYLOAD_FIELD) else {
            log::warn!("Entry {} on {} has no '{}' field, acking and skipping", entry.id, self.stream, PAYLOAD_FIELD);
            tokio::spawn(async move {
                if let Err(e) = ack.ack().await {
                    log::warn!("Failed to ack entry {}: {}", ack.id, e);
                }
            });
            return;
        };

        let published_at = entry_timestamp(&entry.id).unwrap_or_else(Utc::now);
        let delivery = Delivery::new(payload, published_at, ack);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move { handler.handle(delivery).await });
    }
}

/// Publish time encoded in a stream entry id (`<millis>-<seq>`).
pub fn entry_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let millis = id.split_once('-').map_or(id, |(ms, _)| ms).parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(millis)
}
