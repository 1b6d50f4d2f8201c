//! # Broker Control Loop
//!
//! `Broker` is a cheap, cloneable handle. Every state change (connections
//! joining and leaving rooms, upstream create/delete outcomes, timer firings,
//! shutdown) is a message processed in order by a single control task, so the
//! room directory and the per-channel lifecycle are never mutated concurrently.
//!
//! Handles talk to the loop through `commands`; work the loop spawns (upstream
//! calls, timers) reports back through a second, internal queue that the loop
//! itself keeps open. When every handle is gone the loop shuts down the same
//! way `close()` does.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::core::channel::{Channel, RoomKey};
use crate::core::dispatcher::{
    ChannelDispatcher, DispatchCounters, DispatchStats, Dispatcher, DEFAULT_STALE_AFTER,
};
use crate::core::events::OutboundEvent;
use crate::core::lifecycle::{ChannelSlot, ChannelStatus, LifecyclePolicy, Step};
use crate::core::rooms::{ConnectionId, RoomDirectory, DEFAULT_OUTBOX_CAPACITY};
use crate::core::routing::RoomRouter;
use crate::core::scheduler::ScheduledTask;
use crate::upstream::{UpstreamBroker, UpstreamError, UpstreamSubscription};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Channels served by this broker. Rooms of other channels are rejected.
    pub channels: Vec<Channel>,
    pub policy: LifecyclePolicy,
    /// Deliveries older than this are dropped.
    pub stale_after: Duration,
    pub router: RoomRouter,
    /// Frames queued per connection before new ones are dropped for it.
    pub outbox_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channels: Channel::ALL.to_vec(),
            policy: LifecyclePolicy::default(),
            stale_after: DEFAULT_STALE_AFTER,
            router: RoomRouter::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Outcome of a room change request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub joined: Vec<RoomKey>,
    pub left: Vec<RoomKey>,
    /// Requested keys that were malformed or named a channel this broker does
    /// not serve.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub status: ChannelStatus,
    pub subscription: Option<String>,
    pub subscribers: usize,
    pub creates: u64,
    pub deletes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSnapshot {
    pub closing: bool,
    pub connections: usize,
    pub rooms: usize,
    pub channels: Vec<ChannelSnapshot>,
    pub dispatch: DispatchCounters,
}

type Responder<T> = oneshot::Sender<T>;
type EventReceiver = mpsc::Receiver<Arc<OutboundEvent>>;

enum Command {
    Connect {
        rooms: Vec<RoomKey>,
        responder: Responder<Result<(ConnectionId, EventReceiver), BrokerError>>,
    },
    SetRooms {
        id: ConnectionId,
        rooms: Vec<String>,
        responder: Responder<Result<RoomUpdate, BrokerError>>,
    },
    Disconnect {
        id: ConnectionId,
    },
    Snapshot {
        responder: Responder<BrokerSnapshot>,
    },
    Close {
        responder: Responder<()>,
    },
}

/// Outcomes of work spawned by the control loop.
enum Internal {
    Created {
        channel: Channel,
        result: Result<Arc<dyn UpstreamSubscription>, UpstreamError>,
    },
    Deleted {
        channel: Channel,
        result: Result<(), UpstreamError>,
    },
    TimerFired {
        channel: Channel,
        id: u64,
    },
}

#[derive(Clone)]
pub struct Broker {
    commands: mpsc::UnboundedSender<Command>,
    directory: Arc<RoomDirectory>,
    stats: Arc<DispatchStats>,
}

impl Broker {
    /// Spawns the control loop. Must be called from within a Tokio runtime.
    ///
    /// With `LifecyclePolicy::Pinned` every served channel starts subscribing
    /// immediately.
    pub fn start(config: BrokerConfig, upstream: Arc<dyn UpstreamBroker>) -> Broker {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let directory = Arc::new(RoomDirectory::new());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Arc::new(Dispatcher::new(
            directory.clone(),
            config.router,
            config.stale_after,
            stats.clone(),
        ));

        let mut channels = config.channels;
        channels.sort();
        channels.dedup();

        let control = ControlLoop {
            commands: commands_rx,
            internal_tx,
            internal_rx,
            upstream,
            directory: directory.clone(),
            dispatcher,
            stats: stats.clone(),
            policy: config.policy,
            outbox_capacity: config.outbox_capacity.max(1),
            slots: channels.into_iter().map(ChannelSlot::new).collect(),
            next_connection: 1,
            next_timer: 1,
            closing: false,
            close_waiters: Vec::new(),
        };
        tokio::spawn(control.run());

        Broker { commands: commands_tx, directory, stats }
    }

    /// Registers a connection, placing it in `rooms` straight away.
    pub async fn connect(&self, rooms: Vec<RoomKey>) -> Result<ConnectionSession, BrokerError> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { rooms, responder })
            .map_err(|_| BrokerError::Closed)?;
        let (id, events) = rx.await.map_err(|_| BrokerError::Closed)??;
        Ok(ConnectionSession { id, events, commands: self.commands.clone() })
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot, BrokerError> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { responder })
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Drains every connection and retires every upstream subscription.
    ///
    /// Returns once each channel is back to `NONE`. Safe to call more than
    /// once and from several handles; later calls wait for the same shutdown
    /// or return immediately once it is over.
    pub async fn close(&self) {
        let (responder, rx) = oneshot::channel();
        if self.commands.send(Command::Close { responder }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub fn has_subscribers(&self, channel: Channel) -> bool {
        self.directory.has_subscribers(channel)
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.directory.subscriber_count(channel)
    }

    pub fn connection_count(&self) -> usize {
        self.directory.connection_count()
    }

    /// Current rooms of a connection, sorted.
    pub fn rooms_of(&self, id: ConnectionId) -> Option<Vec<RoomKey>> {
        self.directory.rooms_of(id)
    }

    pub fn dispatch_counters(&self) -> DispatchCounters {
        self.stats.snapshot()
    }
}

/// One registered connection. Dropping it leaves every room.
pub struct ConnectionSession {
    id: ConnectionId,
    events: EventReceiver,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next event for this connection. `None` once the broker has dropped the
    /// connection (shutdown).
    pub async fn recv(&mut self) -> Option<Arc<OutboundEvent>> {
        self.events.recv().await
    }

    /// Replaces the connection's room set with `rooms`.
    pub async fn set_rooms(&self, rooms: Vec<String>) -> Result<RoomUpdate, BrokerError> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::SetRooms { id: self.id, rooms, responder })
            .map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Disconnect { id: self.id });
    }
}

struct ControlLoop {
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    upstream: Arc<dyn UpstreamBroker>,
    directory: Arc<RoomDirectory>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<DispatchStats>,
    policy: LifecyclePolicy,
    outbox_capacity: usize,
    slots: Vec<ChannelSlot>,
    next_connection: ConnectionId,
    next_timer: u64,
    closing: bool,
    close_waiters: Vec<Responder<()>>,
}

impl ControlLoop {
    async fn run(mut self) {
        log::info!(
            "Broker started for channels [{}] with {:?}",
            self.slots.iter().map(|s| s.channel.name()).collect::<Vec<_>>().join(", "),
            self.policy
        );
        let served: Vec<Channel> = self.slots.iter().map(|s| s.channel).collect();
        for channel in served {
            self.reconcile(channel);
        }

        let mut handles_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv(), if handles_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        log::info!("All broker handles dropped, shutting down");
                        handles_open = false;
                        self.begin_close();
                    }
                },
                Some(event) = self.internal_rx.recv() => self.on_internal(event),
            }

            if self.closing && self.slots.iter().all(ChannelSlot::is_settled) {
                break;
            }
        }

        log::info!("Broker closed");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { rooms, responder } => {
                let _ = responder.send(self.connect(rooms));
            }
            Command::SetRooms { id, rooms, responder } => {
                let _ = responder.send(self.set_rooms(id, rooms));
            }
            Command::Disconnect { id } => self.disconnect(id),
            Command::Snapshot { responder } => {
                let _ = responder.send(self.snapshot());
            }
            Command::Close { responder } => {
                self.close_waiters.push(responder);
                self.begin_close();
            }
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Created { channel, result } => {
                if self.closing {
                    let orphan = self.slot_mut(channel).and_then(|slot| slot.on_created_during_shutdown(result));
                    if let Some(subscription) = orphan {
                        self.apply(channel, Step::Delete(subscription));
                    }
                } else {
                    let demand = self.directory.has_subscribers(channel);
                    let policy = self.policy;
                    if let Some(step) = self.slot_mut(channel).map(|slot| slot.on_created(result, demand, policy)) {
                        self.apply(channel, step);
                    }
                }
            }
            Internal::Deleted { channel, result } => {
                if self.closing {
                    if let Some(slot) = self.slot_mut(channel) {
                        slot.on_deleted_during_shutdown(result);
                    }
                } else {
                    let demand = self.directory.has_subscribers(channel);
                    let policy = self.policy;
                    if let Some(step) = self.slot_mut(channel).map(|slot| slot.on_deleted(result, demand, policy)) {
                        self.apply(channel, step);
                    }
                }
            }
            Internal::TimerFired { channel, id } => {
                // Timers are cancelled on shutdown; a firing already queued is stale.
                if self.closing {
                    return;
                }
                let demand = self.directory.has_subscribers(channel);
                let policy = self.policy;
                if let Some(step) = self.slot_mut(channel).map(|slot| slot.on_timer(id, demand, policy)) {
                    self.apply(channel, step);
                }
            }
        }
    }

    fn connect(&mut self, rooms: Vec<RoomKey>) -> Result<(ConnectionId, EventReceiver), BrokerError> {
        if self.closing {
            return Err(BrokerError::Closed);
        }
        let id = self.next_connection;
        self.next_connection += 1;

        let (outbox, events) = mpsc::channel(self.outbox_capacity);
        self.directory.register(id, outbox);

        let (accepted, rejected) = self.partition(rooms);
        if !rejected.is_empty() {
            log::warn!("Connection {} initial rooms rejected: {:?}", id, rejected);
        }
        if !accepted.is_empty() {
            self.update_rooms(id, accepted)?;
        }
        log::debug!("Connection {} registered", id);
        Ok((id, events))
    }

    fn set_rooms(&mut self, id: ConnectionId, requested: Vec<String>) -> Result<RoomUpdate, BrokerError> {
        if self.closing {
            return Err(BrokerError::Closed);
        }
        let mut parsed = Vec::with_capacity(requested.len());
        let mut malformed = Vec::new();
        for raw in requested {
            match raw.parse::<RoomKey>() {
                Ok(key) => parsed.push(key),
                Err(e) => {
                    log::warn!("Connection {} sent bad room '{}': {}", id, raw, e);
                    malformed.push(raw);
                }
            }
        }

        let (accepted, mut rejected) = self.partition(parsed);
        rejected.extend(malformed);
        let (joined, left) = self.update_rooms(id, accepted)?;
        Ok(RoomUpdate { joined, left, rejected })
    }

    fn disconnect(&mut self, id: ConnectionId) {
        let before = self.demand();
        if let Some(left) = self.directory.remove(id) {
            log::debug!("Connection {} left {} room(s)", id, left.len());
            self.after_membership_change(before);
        }
    }

    /// Splits requested rooms into served ones and the rendered rejects.
    fn partition(&self, rooms: Vec<RoomKey>) -> (HashSet<RoomKey>, Vec<String>) {
        let mut accepted = HashSet::new();
        let mut rejected = Vec::new();
        for key in rooms {
            if self.serves(key.channel()) {
                accepted.insert(key);
            } else {
                rejected.push(key.to_string());
            }
        }
        (accepted, rejected)
    }

    fn update_rooms(
        &mut self,
        id: ConnectionId,
        target: HashSet<RoomKey>,
    ) -> Result<(Vec<RoomKey>, Vec<RoomKey>), BrokerError> {
        let before = self.demand();
        let delta = self
            .directory
            .set_rooms(id, target)
            .ok_or(BrokerError::UnknownConnection(id))?;
        self.after_membership_change(before);
        Ok((delta.joined, delta.left))
    }

    fn serves(&self, channel: Channel) -> bool {
        self.slots.iter().any(|s| s.channel == channel)
    }

    fn demand(&self) -> Vec<bool> {
        self.slots.iter().map(|s| self.directory.has_subscribers(s.channel)).collect()
    }

    /// Runs the lifecycle of every channel whose demand flipped.
    fn after_membership_change(&mut self, before: Vec<bool>) {
        let after = self.demand();
        let flipped: Vec<Channel> = self
            .slots
            .iter()
            .zip(before.iter().zip(after.iter()))
            .filter(|(_, (b, a))| b != a)
            .map(|(slot, _)| slot.channel)
            .collect();
        for channel in flipped {
            self.reconcile(channel);
        }
    }

    fn reconcile(&mut self, channel: Channel) {
        let demand = self.directory.has_subscribers(channel);
        let policy = self.policy;
        if let Some(step) = self.slot_mut(channel).map(|slot| slot.on_demand(demand, policy)) {
            self.apply(channel, step);
        }
    }

    fn apply(&mut self, channel: Channel, step: Step) {
        match step {
            Step::Idle => {}
            Step::Create => {
                if let Some(slot) = self.slot_mut(channel) {
                    slot.begin_create();
                }
                self.spawn_create(channel);
            }
            Step::Delete(subscription) => {
                if let Some(slot) = self.slot_mut(channel) {
                    slot.begin_delete();
                }
                self.spawn_delete(channel, subscription);
            }
            Step::Arm(delay) => {
                let id = self.next_timer;
                self.next_timer += 1;
                let tx = self.internal_tx.clone();
                let task = ScheduledTask::after(delay, id, move || {
                    let _ = tx.send(Internal::TimerFired { channel, id });
                });
                if let Some(slot) = self.slot_mut(channel) {
                    slot.set_timer(task);
                }
            }
        }
    }

    fn spawn_create(&self, channel: Channel) {
        let upstream = Arc::clone(&self.upstream);
        let handler = Arc::new(ChannelDispatcher { channel, dispatcher: Arc::clone(&self.dispatcher) });
        let tx = self.internal_tx.clone();
        log::info!("Creating upstream subscription for {}", channel);

        tokio::spawn(async move {
            let result = upstream.create_subscription(channel, handler).await.map(Arc::<dyn UpstreamSubscription>::from);
            if let Err(mpsc::error::SendError(Internal::Created { result: Ok(orphan), .. })) =
                tx.send(Internal::Created { channel, result })
            {
                // Control loop is gone; nobody else will retire it.
                if let Err(e) = orphan.delete().await {
                    log::error!("Failed to delete orphaned subscription {}: {}", orphan.name(), e);
                }
            }
        });
    }

    fn spawn_delete(&self, channel: Channel, subscription: Arc<dyn UpstreamSubscription>) {
        let tx = self.internal_tx.clone();
        log::info!("Deleting upstream subscription {} for {}", subscription.name(), channel);

        tokio::spawn(async move {
            let result = subscription.delete().await;
            let _ = tx.send(Internal::Deleted { channel, result });
        });
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        let drained = self.directory.drain();
        log::info!("Closing broker: dropped {} connection(s)", drained);

        let served: Vec<Channel> = self.slots.iter().map(|s| s.channel).collect();
        for channel in served {
            if let Some(subscription) = self.slot_mut(channel).and_then(ChannelSlot::begin_shutdown) {
                self.apply(channel, Step::Delete(subscription));
            }
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            closing: self.closing,
            connections: self.directory.connection_count(),
            rooms: self.directory.room_count(),
            channels: self
                .slots
                .iter()
                .map(|slot| ChannelSnapshot {
                    channel: slot.channel,
                    status: slot.status,
                    subscription: slot.subscription_name().map(str::to_string),
                    subscribers: self.directory.subscriber_count(slot.channel),
                    creates: slot.creates,
                    deletes: slot.deletes,
                })
                .collect(),
            dispatch: self.stats.snapshot(),
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> Option<&mut ChannelSlot> {
        self.slots.iter_mut().find(|s| s.channel == channel)
    }
}
