//! # Message Dispatcher
//!
//! Runs once per upstream delivery:
//!
//! 1. ack the delivery (fire-and-forget fan-out, never redelivered)
//! 2. drop it if it is older than the staleness threshold
//! 3. split the payload into raw items
//! 4. per item: compute target rooms, look up recipients, and only when there
//!    is at least one recipient decode, encode once and enqueue the frame
//!
//! Deliveries are handled concurrently. The dispatcher only reads the room
//! directory.
//!
//! Outboxes are bounded. A connection that stops reading loses new frames
//! once its queue is full instead of growing it; those drops are counted as
//! `lagged`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::channel::Channel;
use crate::core::events::{split_batch, Event, OutboundEvent};
use crate::core::rooms::RoomDirectory;
use crate::core::routing::RoomRouter;
use crate::upstream::{Delivery, DeliveryHandler};

/// Default maximum age of a delivery.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct DispatchStats {
    deliveries: AtomicU64,
    ack_failures: AtomicU64,
    stale: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
    skipped: AtomicU64,
    decoded: AtomicU64,
    emitted: AtomicU64,
    lagged: AtomicU64,
}

/// Point-in-time copy of `DispatchStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCounters {
    pub deliveries: u64,
    pub ack_failures: u64,
    pub stale: u64,
    pub malformed: u64,
    pub unrouted: u64,
    /// Items nobody was listening for, dropped before decoding.
    pub skipped: u64,
    pub decoded: u64,
    /// Frames enqueued, one per recipient.
    pub emitted: u64,
    /// Frames dropped because the recipient's queue was full.
    pub lagged: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounters {
        DispatchCounters {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    directory: Arc<RoomDirectory>,
    router: RoomRouter,
    stale_after: Duration,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<RoomDirectory>,
        router: RoomRouter,
        stale_after: Duration,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self { directory, router, stale_after, stats }
    }

    pub async fn dispatch(&self, channel: Channel, delivery: Delivery) {
        DispatchStats::bump(&self.stats.deliveries, 1);

        if let Err(e) = delivery.ack().await {
            DispatchStats::bump(&self.stats.ack_failures, 1);
            log::warn!("Failed to ack {} delivery: {}", channel, e);
        }

        let age = delivery.age(Utc::now());
        if age > self.stale_after {
            DispatchStats::bump(&self.stats.stale, 1);
            log::warn!("Dropping stale {} message, {}ms old", channel, age.as_millis());
            return;
        }

        let items = match split_batch(&delivery.payload) {
            Ok(items) => items,
            Err(e) => {
                DispatchStats::bump(&self.stats.malformed, 1);
                log::error!("Malformed {} payload ({} bytes): {}", channel, delivery.payload.len(), e);
                return;
            }
        };

        for item in items {
            let targets = match self.router.targets(channel, &item) {
                Ok(targets) => targets,
                Err(e) => {
                    DispatchStats::bump(&self.stats.unrouted, 1);
                    log::warn!("Cannot route {} item: {}", channel, e);
                    continue;
                }
            };

            let recipients = self.directory.recipients(&targets);
            if recipients.is_empty() {
                DispatchStats::bump(&self.stats.skipped, 1);
                continue;
            }

            let outbound = match Event::decode(channel, item).and_then(|event| OutboundEvent::encode(&event)) {
                Ok(outbound) => outbound,
                Err(e) => {
                    DispatchStats::bump(&self.stats.malformed, 1);
                    log::warn!("Dropping undecodable {} item: {}", channel, e);
                    continue;
                }
            };
            DispatchStats::bump(&self.stats.decoded, 1);

            let (mut sent, mut lagged) = (0, 0);
            for outbox in recipients {
                match outbox.try_send(Arc::clone(&outbound)) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => lagged += 1,
                    // Connection is going away.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            DispatchStats::bump(&self.stats.emitted, sent);
            if lagged > 0 {
                DispatchStats::bump(&self.stats.lagged, lagged);
                log::debug!("Dropped {} item for {} slow connection(s)", channel, lagged);
            }
        }
    }
}

/// Binds a `Dispatcher` to the channel of one upstream subscription.
pub struct ChannelDispatcher {
    pub channel: Channel,
    pub dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl DeliveryHandler for ChannelDispatcher {
    async fn handle(&self, delivery: Delivery) {
        self.dispatcher.dispatch(self.channel, delivery).await;
    }
}
