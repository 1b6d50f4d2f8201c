//! # Channel Lifecycle
//!
//! One state machine per channel decides when the upstream subscription is
//! created and retired.
//!
//! ```text
//!  NONE --demand--> CREATING --ok--> SUBSCRIBING --no demand--> PENDING_DELETE
//!   ^                  |  ^                ^                      |      ^
//!   |               err|  |backoff         +------demand----------+      |
//!   |                  +--+                                              |
//!   +---------ok--------- DELETING <--------retention elapsed------------+
//!                            |                                           |
//!                            +------------------err (backoff)------------+
//! ```
//!
//! The status is the single owner of "is an operation in flight": a trigger
//! that arrives while CREATING or DELETING is a no-op, and the outcome of the
//! operation re-reads demand when it lands. Transitions are synchronous; the
//! broker control loop carries out the returned `Step`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::channel::Channel;
use crate::core::scheduler::ScheduledTask;
use crate::upstream::{UpstreamError, UpstreamSubscription};

/// Default grace period before an idle subscription is deleted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(20);

/// Default pause between failed create/delete attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    None,
    Creating,
    Subscribing,
    PendingDelete,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePolicy {
    /// Subscribe while there is demand, keep the subscription for `retention`
    /// after demand drops to zero.
    OnDemand { retention: Duration, retry_backoff: Duration },
    /// Subscribe at startup and hold the subscription until shutdown.
    Pinned { retry_backoff: Duration },
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        LifecyclePolicy::OnDemand { retention: DEFAULT_RETENTION, retry_backoff: DEFAULT_RETRY_BACKOFF }
    }
}

impl LifecyclePolicy {
    fn retry_backoff(self) -> Duration {
        match self {
            LifecyclePolicy::OnDemand { retry_backoff, .. } | LifecyclePolicy::Pinned { retry_backoff } => {
                retry_backoff
            }
        }
    }

    fn retention(self) -> Option<Duration> {
        match self {
            LifecyclePolicy::OnDemand { retention, .. } => Some(retention),
            LifecyclePolicy::Pinned { .. } => None,
        }
    }

    /// Whether a subscription is wanted given the current demand.
    fn wants(self, has_subscribers: bool) -> bool {
        has_subscribers || matches!(self, LifecyclePolicy::Pinned { .. })
    }
}

/// Side effect requested by a transition.
pub(crate) enum Step {
    Idle,
    Create,
    Delete(Arc<dyn UpstreamSubscription>),
    Arm(Duration),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Idle => f.write_str("Idle"),
            Step::Create => f.write_str("Create"),
            Step::Delete(sub) => write!(f, "Delete({})", sub.name()),
            Step::Arm(d) => write!(f, "Arm({:?})", d),
        }
    }
}

/// Lifecycle record of one channel.
pub(crate) struct ChannelSlot {
    pub channel: Channel,
    pub status: ChannelStatus,
    subscription: Option<Arc<dyn UpstreamSubscription>>,
    timer: Option<ScheduledTask>,
    /// An upstream create or delete call is running right now.
    in_flight: bool,
    pub creates: u64,
    pub deletes: u64,
}

impl ChannelSlot {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            status: ChannelStatus::None,
            subscription: None,
            timer: None,
            in_flight: false,
            creates: 0,
            deletes: 0,
        }
    }

    pub fn subscription_name(&self) -> Option<&str> {
        self.subscription.as_deref().map(|s| s.name())
    }

    pub fn timer_id(&self) -> Option<u64> {
        self.timer.as_ref().map(ScheduledTask::id)
    }

    pub fn set_timer(&mut self, task: ScheduledTask) {
        self.clear_timer();
        self.timer = Some(task);
    }

    /// Cancel-then-clear, so a cancelled timer can never be mistaken for the
    /// current one.
    fn clear_timer(&mut self) {
        if let Some(task) = self.timer.take() {
            task.cancel();
        }
    }

    /// Records that the broker is starting an upstream create call.
    pub fn begin_create(&mut self) {
        self.in_flight = true;
        self.creates += 1;
    }

    /// Records that the broker is starting an upstream delete call.
    pub fn begin_delete(&mut self) {
        self.in_flight = true;
        self.deletes += 1;
    }

    /// Demand for the channel changed (or the broker is starting).
    pub fn on_demand(&mut self, has_subscribers: bool, policy: LifecyclePolicy) -> Step {
        let wanted = policy.wants(has_subscribers);
        match self.status {
            ChannelStatus::None if wanted => {
                self.status = ChannelStatus::Creating;
                Step::Create
            }
            ChannelStatus::Subscribing if !wanted => match policy.retention() {
                Some(retention) => {
                    self.status = ChannelStatus::PendingDelete;
                    Step::Arm(retention)
                }
                None => Step::Idle,
            },
            ChannelStatus::PendingDelete if wanted => {
                self.clear_timer();
                self.status = ChannelStatus::Subscribing;
                Step::Idle
            }
            // CREATING and DELETING own the channel until their outcome lands.
            _ => Step::Idle,
        }
    }

    pub fn on_created(
        &mut self,
        result: Result<Arc<dyn UpstreamSubscription>, UpstreamError>,
        has_subscribers: bool,
        policy: LifecyclePolicy,
    ) -> Step {
        self.in_flight = false;
        if self.status != ChannelStatus::Creating {
            return match result {
                Ok(orphan) => {
                    log::warn!("Channel {} got a subscription while {:?}, deleting it", self.channel, self.status);
                    Step::Delete(orphan)
                }
                Err(_) => Step::Idle,
            };
        }

        match result {
            Ok(subscription) => {
                log::info!("Channel {} subscribed via {}", self.channel, subscription.name());
                self.subscription = Some(subscription);
                self.status = ChannelStatus::Subscribing;
                self.on_demand(has_subscribers, policy)
            }
            Err(e) => {
                let backoff = policy.retry_backoff();
                log::warn!("Channel {} subscription create failed: {}. Retrying in {:?}", self.channel, e, backoff);
                Step::Arm(backoff)
            }
        }
    }

    pub fn on_deleted(
        &mut self,
        result: Result<(), UpstreamError>,
        has_subscribers: bool,
        policy: LifecyclePolicy,
    ) -> Step {
        self.in_flight = false;
        if self.status != ChannelStatus::Deleting {
            return Step::Idle;
        }

        match result {
            Ok(()) => {
                log::info!("Channel {} unsubscribed", self.channel);
                self.subscription = None;
                self.status = ChannelStatus::None;
                self.on_demand(has_subscribers, policy)
            }
            Err(e) => {
                let backoff = policy.retry_backoff();
                log::warn!("Channel {} subscription delete failed: {}. Retrying in {:?}", self.channel, e, backoff);
                self.status = ChannelStatus::PendingDelete;
                Step::Arm(backoff)
            }
        }
    }

    /// A timer fired. Firings of anything but the current timer are ignored.
    pub fn on_timer(&mut self, id: u64, has_subscribers: bool, policy: LifecyclePolicy) -> Step {
        if self.timer_id() != Some(id) {
            log::debug!("Ignoring stale timer {} on channel {}", id, self.channel);
            return Step::Idle;
        }
        self.timer = None;
        let wanted = policy.wants(has_subscribers);

        match self.status {
            // Create backoff elapsed.
            ChannelStatus::Creating if wanted => Step::Create,
            ChannelStatus::Creating => {
                log::info!("Channel {} lost its demand while retrying create", self.channel);
                self.status = ChannelStatus::None;
                Step::Idle
            }
            // Retention (or delete backoff) elapsed.
            ChannelStatus::PendingDelete if !wanted => match self.subscription.clone() {
                Some(subscription) => {
                    self.status = ChannelStatus::Deleting;
                    Step::Delete(subscription)
                }
                None => {
                    self.status = ChannelStatus::None;
                    Step::Idle
                }
            },
            ChannelStatus::PendingDelete => {
                self.status = ChannelStatus::Subscribing;
                Step::Idle
            }
            _ => Step::Idle,
        }
    }

    /// Starts shutdown for this channel. Returns the subscription to delete,
    /// if one is live and no delete is already running.
    pub fn begin_shutdown(&mut self) -> Option<Arc<dyn UpstreamSubscription>> {
        self.clear_timer();
        match self.status {
            ChannelStatus::Subscribing | ChannelStatus::PendingDelete => {
                self.status = ChannelStatus::Deleting;
                self.subscription.clone()
            }
            // Only backing off between attempts: nothing upstream to retire.
            ChannelStatus::Creating if !self.in_flight => {
                self.status = ChannelStatus::None;
                None
            }
            _ => None,
        }
    }

    /// Create outcome while shutting down: anything that got created is
    /// deleted straight away.
    pub fn on_created_during_shutdown(
        &mut self,
        result: Result<Arc<dyn UpstreamSubscription>, UpstreamError>,
    ) -> Option<Arc<dyn UpstreamSubscription>> {
        self.in_flight = false;
        match result {
            Ok(subscription) => {
                self.subscription = Some(subscription.clone());
                self.status = ChannelStatus::Deleting;
                Some(subscription)
            }
            Err(_) => {
                self.status = ChannelStatus::None;
                None
            }
        }
    }

    /// Delete outcome while shutting down: failures are logged, never retried.
    pub fn on_deleted_during_shutdown(&mut self, result: Result<(), UpstreamError>) {
        self.in_flight = false;
        if let Err(e) = result {
            log::error!(
                "Channel {} subscription {} could not be deleted during shutdown: {}",
                self.channel,
                self.subscription_name().unwrap_or("?"),
                e
            );
        }
        self.subscription = None;
        self.status = ChannelStatus::None;
    }

    /// Nothing in flight and nothing left upstream.
    pub fn is_settled(&self) -> bool {
        self.status == ChannelStatus::None && !self.in_flight
    }
}
