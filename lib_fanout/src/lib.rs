//! # lib_fanout
//!
//! Demand-driven publish/subscribe fan-out. A small, fixed set of durable
//! upstream topics is multiplexed to many WebSocket connections grouped into
//! interest-based rooms, while the upstream subscriptions themselves are created
//! and retired as downstream demand comes and goes.
//!
//! Module map:
//! - **`core`**: channels and rooms, the room directory, the per-channel
//!   lifecycle state machine, the dispatcher and the broker control loop.
//! - **`identity`**: the connection gate (client-declared or identity-routed).
//! - **`upstream`**: the upstream broker seam plus the Redis Streams adapter
//!   (`connections` feature).
//! - **`retrieve`**: HTTP collaborators for token introspection and account
//!   lookup (`retrieve` feature).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod core;
pub mod identity;
pub mod upstream;

#[cfg(feature = "retrieve")]
pub mod retrieve;

// --- Public API Re-exports ---
pub use crate::core::{
    Broker, BrokerConfig, BrokerError, BrokerSnapshot, Channel, ChannelStatus, ConnectionSession,
    Event, LifecyclePolicy, OutboundEvent, RoomKey, RoomKeyError, RoomUpdate,
};
pub use crate::identity::{Admission, GateError, IdentityDecoder, IdentityGate, RoomSalt};
pub use crate::upstream::{
    Delivery, DeliveryHandler, UpstreamBroker, UpstreamError, UpstreamSubscription,
};
