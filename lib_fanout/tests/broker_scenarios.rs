//! # Broker Scenarios
//!
//! End-to-end behaviour of the broker against an in-memory upstream: demand
//! driven subscription lifecycle, room fan-out, staleness and shutdown. Time is
//! paused so retention and backoff windows run instantly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};

use lib_fanout::core::RoomRouter;
use lib_fanout::identity::{AccountResolver, Identity, TokenIntrospector};
use lib_fanout::upstream::Acknowledge;
use lib_fanout::{
    Broker, BrokerConfig, BrokerError, BrokerSnapshot, Channel, ChannelStatus, ConnectionSession, Delivery,
    DeliveryHandler, GateError, IdentityDecoder, IdentityGate, LifecyclePolicy, RoomKey, RoomSalt, UpstreamBroker,
    UpstreamError, UpstreamSubscription,
};

#[derive(Default)]
struct MockState {
    handlers: HashMap<Channel, Arc<dyn DeliveryHandler>>,
    create_calls: usize,
    delete_calls: usize,
    fail_creates: usize,
    fail_deletes: usize,
    next_name: usize,
    create_delay: Duration,
    creating: usize,
    max_creating: usize,
}

#[derive(Clone, Default)]
struct MockUpstream {
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    fn failing(creates: usize, deletes: usize) -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.fail_creates = creates;
            state.fail_deletes = deletes;
        }
        mock
    }

    fn slow(create_delay: Duration) -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().create_delay = create_delay;
        mock
    }

    fn max_concurrent_creates(&self) -> usize {
        self.state.lock().unwrap().max_creating
    }

    fn creates(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    fn deletes(&self) -> usize {
        self.state.lock().unwrap().delete_calls
    }

    /// Hands `payload` to the live subscription of `channel`, if any.
    async fn publish_at(&self, channel: Channel, payload: &str, published_at: DateTime<Utc>) -> bool {
        let handler = self.state.lock().unwrap().handlers.get(&channel).cloned();
        match handler {
            Some(handler) => {
                handler.handle(Delivery::new(payload.as_bytes().to_vec(), published_at, NoopAck)).await;
                true
            }
            None => false,
        }
    }

    async fn publish(&self, channel: Channel, payload: &str) -> bool {
        self.publish_at(channel, payload, Utc::now()).await
    }
}

#[async_trait]
impl UpstreamBroker for MockUpstream {
    async fn create_subscription(
        &self,
        channel: Channel,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Box<dyn UpstreamSubscription>, UpstreamError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            state.creating += 1;
            state.max_creating = state.max_creating.max(state.creating);
            state.create_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.creating -= 1;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(UpstreamError::Rejected("create refused".to_string()));
        }
        state.next_name += 1;
        state.handlers.insert(channel, handler);
        Ok(Box::new(MockSubscription {
            channel,
            name: format!("mock.{}.{}", channel, state.next_name),
            state: self.state.clone(),
        }))
    }
}

struct MockSubscription {
    channel: Channel,
    name: String,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl UpstreamSubscription for MockSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn delete(&self) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        if state.fail_deletes > 0 {
            state.fail_deletes -= 1;
            return Err(UpstreamError::Rejected("delete refused".to_string()));
        }
        state.handlers.remove(&self.channel);
        Ok(())
    }
}

struct NoopAck;

#[async_trait]
impl Acknowledge for NoopAck {
    async fn ack(&self) -> Result<(), UpstreamError> {
        Ok(())
    }
}

const RETENTION: Duration = Duration::from_secs(20);
const BACKOFF: Duration = Duration::from_secs(1);

fn on_demand() -> BrokerConfig {
    BrokerConfig {
        policy: LifecyclePolicy::OnDemand { retention: RETENTION, retry_backoff: BACKOFF },
        ..BrokerConfig::default()
    }
}

fn start(mock: &MockUpstream, config: BrokerConfig) -> Broker {
    Broker::start(config, Arc::new(mock.clone()))
}

/// Lets the control loop and every spawned task run to idle.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

fn rooms(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|r| r.to_string()).collect()
}

fn status_of(snapshot: &BrokerSnapshot, channel: Channel) -> ChannelStatus {
    snapshot
        .channels
        .iter()
        .find(|c| c.channel == channel)
        .map(|c| c.status)
        .unwrap()
}

async fn status(broker: &Broker, channel: Channel) -> ChannelStatus {
    status_of(&broker.snapshot().await.unwrap(), channel)
}

async fn next_frame(session: &mut ConnectionSession) -> Option<String> {
    timeout(Duration::from_millis(50), session.recv())
        .await
        .ok()
        .flatten()
        .map(|event| event.frame.clone())
}

#[tokio::test(start_paused = true)]
async fn only_items_for_joined_rooms_are_delivered() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let mut session = broker.connect(Vec::new()).await.unwrap();

    let update = session.set_rooms(rooms(&["price_a"])).await.unwrap();
    assert_eq!(update.joined.len(), 1);
    settle().await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Subscribing);

    assert!(
        mock.publish(Channel::Price, r#"[{"id":"a","price":1.0},{"id":"b","price":2.0}]"#)
            .await
    );
    let frame = next_frame(&mut session).await.unwrap();
    assert!(frame.contains(r#""event":"price""#));
    assert!(frame.contains(r#""id":"a""#));
    assert_eq!(next_frame(&mut session).await, None);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_replaces_the_room_set() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let mut session = broker.connect(Vec::new()).await.unwrap();

    session.set_rooms(rooms(&["price_a", "price_c"])).await.unwrap();
    let update = session.set_rooms(rooms(&["price_b", "price_c"])).await.unwrap();
    assert_eq!(update.joined.iter().map(ToString::to_string).collect::<Vec<_>>(), vec!["price_b"]);
    assert_eq!(update.left.iter().map(ToString::to_string).collect::<Vec<_>>(), vec!["price_a"]);
    settle().await;

    mock.publish(
        Channel::Price,
        r#"[{"id":"a","price":1.0},{"id":"b","price":2.0},{"id":"c","price":3.0}]"#,
    )
    .await;
    assert!(next_frame(&mut session).await.unwrap().contains(r#""id":"b""#));
    assert!(next_frame(&mut session).await.unwrap().contains(r#""id":"c""#));
    assert_eq!(next_frame(&mut session).await, None);
    assert_eq!(mock.creates(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_subscription_is_deleted_once_after_retention() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["trade_x"])).await.unwrap();
    settle().await;

    session.set_rooms(Vec::new()).await.unwrap();
    settle().await;
    assert_eq!(status(&broker, Channel::Trade).await, ChannelStatus::PendingDelete);

    sleep(RETENTION - Duration::from_secs(1)).await;
    assert_eq!(mock.deletes(), 0);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(mock.deletes(), 1);
    assert_eq!(status(&broker, Channel::Trade).await, ChannelStatus::None);

    sleep(RETENTION * 3).await;
    assert_eq!(mock.deletes(), 1);
    assert_eq!(mock.creates(), 1);
}

#[tokio::test(start_paused = true)]
async fn demand_returning_within_retention_keeps_the_subscription() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let first = broker.connect(Vec::new()).await.unwrap();
    first.set_rooms(rooms(&["status"])).await.unwrap();
    settle().await;

    drop(first);
    settle().await;
    assert_eq!(status(&broker, Channel::Status).await, ChannelStatus::PendingDelete);

    sleep(RETENTION / 2).await;
    let second = broker.connect(Vec::new()).await.unwrap();
    second.set_rooms(rooms(&["status"])).await.unwrap();
    settle().await;
    assert_eq!(status(&broker, Channel::Status).await, ChannelStatus::Subscribing);

    sleep(RETENTION * 2).await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.deletes(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_messages_are_never_delivered() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let mut session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;

    let old = Utc::now() - chrono::Duration::seconds(6);
    assert!(mock.publish_at(Channel::Price, r#"{"id":"a","price":1.0}"#, old).await);
    assert_eq!(next_frame(&mut session).await, None);
    assert_eq!(broker.dispatch_counters().stale, 1);
}

#[tokio::test(start_paused = true)]
async fn items_without_listeners_are_never_decoded() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;

    mock.publish(Channel::Price, r#"{"id":"z","price":9.0}"#).await;
    let counters = broker.dispatch_counters();
    assert_eq!(counters.decoded, 0);
    assert_eq!(counters.skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn subscriber_count_tracks_distinct_connections() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let one = broker.connect(Vec::new()).await.unwrap();
    let two = broker.connect(Vec::new()).await.unwrap();

    one.set_rooms(rooms(&["price_a", "price_b", "price_all"])).await.unwrap();
    two.set_rooms(rooms(&["price_a"])).await.unwrap();
    assert_eq!(broker.subscriber_count(Channel::Price), 2);
    assert_eq!(broker.subscriber_count(Channel::Trade), 0);

    drop(one);
    settle().await;
    assert_eq!(broker.subscriber_count(Channel::Price), 1);
    assert!(broker.has_subscribers(Channel::Price));
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unserved_and_malformed_rooms_are_rejected() {
    let mock = MockUpstream::default();
    let broker = start(&mock, BrokerConfig { channels: vec![Channel::Price], ..on_demand() });
    let session = broker.connect(Vec::new()).await.unwrap();

    let update = session
        .set_rooms(rooms(&["price_a", "trade_x", "bogus_1", "price"]))
        .await
        .unwrap();
    assert_eq!(update.joined.len(), 1);
    let mut rejected = update.rejected.clone();
    rejected.sort();
    assert_eq!(rejected, vec!["bogus_1", "price", "trade_x"]);
    settle().await;
    assert_eq!(mock.creates(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_create_is_retried_after_backoff() {
    let mock = MockUpstream::failing(1, 0);
    let broker = start(&mock, on_demand());
    let session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;

    assert_eq!(mock.creates(), 1);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Creating);

    sleep(BACKOFF + Duration::from_millis(10)).await;
    assert_eq!(mock.creates(), 2);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Subscribing);
}

#[tokio::test(start_paused = true)]
async fn failed_delete_is_retried_after_backoff() {
    let mock = MockUpstream::failing(0, 1);
    let broker = start(&mock, on_demand());
    let session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;
    session.set_rooms(Vec::new()).await.unwrap();

    sleep(RETENTION + Duration::from_millis(10)).await;
    assert_eq!(mock.deletes(), 1);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::PendingDelete);

    sleep(BACKOFF + Duration::from_millis(10)).await;
    assert_eq!(mock.deletes(), 2);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::None);
}

#[tokio::test(start_paused = true)]
async fn close_retires_everything_exactly_once() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let mut one = broker.connect(Vec::new()).await.unwrap();
    let two = broker.connect(Vec::new()).await.unwrap();
    one.set_rooms(rooms(&["price_a"])).await.unwrap();
    two.set_rooms(rooms(&["status"])).await.unwrap();
    settle().await;
    assert_eq!(mock.creates(), 2);

    let other = broker.clone();
    tokio::join!(broker.close(), other.close());
    assert_eq!(mock.deletes(), 2);

    broker.close().await;
    assert_eq!(mock.deletes(), 2);

    assert!(one.recv().await.is_none());
    assert!(matches!(broker.connect(Vec::new()).await, Err(BrokerError::Closed)));
    assert!(matches!(two.set_rooms(rooms(&["status"])).await, Err(BrokerError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn close_during_pending_delete_cancels_the_timer() {
    let mock = MockUpstream::default();
    let broker = start(&mock, on_demand());
    let session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;
    session.set_rooms(Vec::new()).await.unwrap();
    settle().await;

    broker.close().await;
    assert_eq!(mock.deletes(), 1);
    sleep(RETENTION * 2).await;
    assert_eq!(mock.deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn pinned_channels_subscribe_at_startup() {
    let mock = MockUpstream::default();
    let broker = start(
        &mock,
        BrokerConfig {
            channels: vec![Channel::Account],
            policy: LifecyclePolicy::Pinned { retry_backoff: BACKOFF },
            ..BrokerConfig::default()
        },
    );
    settle().await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(status(&broker, Channel::Account).await, ChannelStatus::Subscribing);

    let session = broker.connect(Vec::new()).await.unwrap();
    drop(session);
    sleep(RETENTION * 2).await;
    assert_eq!(mock.deletes(), 0);

    broker.close().await;
    assert_eq!(mock.deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_delete_leaves_the_subscription_delivering() {
    let mock = MockUpstream::failing(0, 1);
    let broker = start(&mock, on_demand());
    let mut session = broker.connect(Vec::new()).await.unwrap();
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;
    session.set_rooms(Vec::new()).await.unwrap();

    sleep(RETENTION + Duration::from_millis(10)).await;
    assert_eq!(mock.deletes(), 1);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::PendingDelete);

    // Demand is back before the delete is retried.
    sleep(BACKOFF / 2).await;
    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Subscribing);

    assert!(mock.publish(Channel::Price, r#"{"id":"a","price":1.0}"#).await);
    assert!(next_frame(&mut session).await.unwrap().contains(r#""id":"a""#));

    sleep(BACKOFF * 5).await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn demand_flapping_during_a_slow_create_issues_one_create() {
    let mock = MockUpstream::slow(Duration::from_secs(5));
    let broker = start(&mock, on_demand());
    let mut session = broker.connect(Vec::new()).await.unwrap();

    session.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Creating);

    for _ in 0..3 {
        session.set_rooms(Vec::new()).await.unwrap();
        settle().await;
        session.set_rooms(rooms(&["price_a"])).await.unwrap();
        settle().await;
        assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Creating);
    }

    sleep(Duration::from_secs(6)).await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.max_concurrent_creates(), 1);
    assert_eq!(status(&broker, Channel::Price).await, ChannelStatus::Subscribing);

    assert!(mock.publish(Channel::Price, r#"{"id":"a","price":1.0}"#).await);
    assert!(next_frame(&mut session).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn a_client_that_stops_reading_has_a_bounded_backlog() {
    let mock = MockUpstream::default();
    let broker = start(&mock, BrokerConfig { outbox_capacity: 4, ..on_demand() });
    let mut idle = broker.connect(Vec::new()).await.unwrap();
    let mut reader = broker.connect(Vec::new()).await.unwrap();
    idle.set_rooms(rooms(&["price_a"])).await.unwrap();
    reader.set_rooms(rooms(&["price_a"])).await.unwrap();
    settle().await;

    for n in 0..100 {
        mock.publish(Channel::Price, &format!(r#"{{"id":"a","price":{}.0}}"#, n)).await;
        assert!(next_frame(&mut reader).await.is_some());
    }

    let counters = broker.dispatch_counters();
    assert_eq!(counters.lagged, 96);
    assert_eq!(counters.emitted, 104);

    for _ in 0..4 {
        assert!(next_frame(&mut idle).await.is_some());
    }
    assert_eq!(next_frame(&mut idle).await, None);
}

/// Maps opaque tokens to subjects.
struct TokenTable(HashMap<&'static str, &'static str>);

#[async_trait]
impl TokenIntrospector for TokenTable {
    async fn introspect(&self, token: &str) -> Result<Identity, GateError> {
        let subject = self.0.get(token).ok_or(GateError::Inactive)?;
        Ok(Identity { subject: subject.to_string(), token: token.to_string() })
    }
}

/// Maps subjects to the accounts they may follow.
struct AccountTable(HashMap<&'static str, Vec<&'static str>>);

#[async_trait]
impl AccountResolver for AccountTable {
    async fn resolve_accounts(&self, identity: &Identity) -> Result<Vec<String>, GateError> {
        self.0
            .get(identity.subject.as_str())
            .map(|ids| ids.iter().map(|id| id.to_string()).collect())
            .ok_or_else(|| GateError::AccountLookup(format!("no accounts for {}", identity.subject)))
    }
}

#[tokio::test(start_paused = true)]
async fn identity_routed_account_events_reach_only_their_owner() {
    let salt = RoomSalt::new("pepper");
    let gate = IdentityGate::IdentityRouted {
        decoder: IdentityDecoder::Introspect(Arc::new(TokenTable(HashMap::from([
            ("token-alice", "alice"),
            ("token-bob", "bob"),
        ])))),
        accounts: Arc::new(AccountTable(HashMap::from([("alice", vec!["acc-1"]), ("bob", vec!["acc-2"])]))),
        salt: salt.clone(),
    };

    let mock = MockUpstream::default();
    let broker = start(
        &mock,
        BrokerConfig {
            channels: vec![Channel::Account],
            policy: LifecyclePolicy::Pinned { retry_backoff: BACKOFF },
            router: RoomRouter::new(Some(salt.clone())),
            ..BrokerConfig::default()
        },
    );

    let alice = gate.admit(Some("token-alice")).await.unwrap();
    assert!(!alice.accepts_subscribe);
    assert_eq!(alice.rooms, vec![salt.account_room("acc-1")]);
    let bob = gate.admit(Some("token-bob")).await.unwrap();
    assert!(matches!(gate.admit(Some("token-mallory")).await, Err(GateError::Inactive)));

    let mut alice = broker.connect(alice.rooms).await.unwrap();
    let mut bob = broker.connect(bob.rooms).await.unwrap();
    let raw_room: RoomKey = "account_acc-1".parse().unwrap();
    let mut raw = broker.connect(vec![raw_room]).await.unwrap();
    settle().await;
    assert_eq!(mock.creates(), 1);
    assert_eq!(status(&broker, Channel::Account).await, ChannelStatus::Subscribing);

    assert!(mock.publish(Channel::Account, r#"{"accountId":"acc-1","kind":"fill","data":{"qty":3}}"#).await);

    let frame = next_frame(&mut alice).await.unwrap();
    assert!(frame.contains(r#""event":"account""#));
    assert!(frame.contains(r#""accountId":"acc-1""#));
    assert_eq!(next_frame(&mut alice).await, None);
    assert_eq!(next_frame(&mut bob).await, None);
    assert_eq!(next_frame(&mut raw).await, None);
}
