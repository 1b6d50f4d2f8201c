//! # Upstream Broker Seam
//!
//! The broker never talks to a queue directly. It asks an `UpstreamBroker` to
//! create a subscription for a channel, registering a `DeliveryHandler` once
//! for the lifetime of that subscription, and later asks the returned
//! `UpstreamSubscription` to delete itself.
//!
//! Each `Delivery` carries its payload, the time the upstream accepted it and
//! an acknowledgement handle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::channel::Channel;

/// Redis Streams implementation (consumer groups as subscriptions).
#[cfg(feature = "connections")]
pub mod redis_streams;

#[cfg(feature = "connections")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[cfg(feature = "connections")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
}

/// Acknowledges one delivery to the upstream queue.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), UpstreamError>;
}

/// One message handed over by an active upstream subscription.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, published_at: DateTime<Utc>, acker: impl Acknowledge + 'static) -> Self {
        Self { payload, published_at, acker: Box::new(acker) }
    }

    pub async fn ack(&self) -> Result<(), UpstreamError> {
        self.acker.ack().await
    }

    /// Time since publication. Clock skew never yields a negative age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.published_at).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("published_at", &self.published_at)
            .finish()
    }
}

/// Receives every delivery of one subscription. Deliveries may arrive
/// concurrently.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// A live upstream registration for one channel.
#[async_trait]
pub trait UpstreamSubscription: Send + Sync {
    /// Upstream name of the subscription, for logs.
    fn name(&self) -> &str;

    /// Removes the registration upstream, then stops deliveries.
    ///
    /// A failed delete must leave the subscription delivering: the broker
    /// keeps it and may hand it back to returning demand.
    async fn delete(&self) -> Result<(), UpstreamError>;
}

#[async_trait]
pub trait UpstreamBroker: Send + Sync {
    async fn create_subscription(
        &self,
        channel: Channel,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn UpstreamSubscription>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoAck;

    #[async_trait]
    impl Acknowledge for NoAck {
        async fn ack(&self) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    #[test]
    fn age_is_never_negative() {
        let now = Utc::now();
        let future = Delivery::new(Vec::new(), now + chrono::Duration::seconds(3), NoAck);
        assert_eq!(future.age(now), Duration::ZERO);

        let past = Delivery::new(Vec::new(), now - chrono::Duration::seconds(6), NoAck);
        assert_eq!(past.age(now), Duration::from_secs(6));
    }
}
