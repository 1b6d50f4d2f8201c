pub mod broker;
pub mod channel;
pub mod dispatcher;
pub mod events;
pub mod lifecycle;
pub mod rooms;
pub mod routing;
pub mod scheduler;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerSnapshot, ChannelSnapshot, ConnectionSession, RoomUpdate};
pub use channel::{Channel, RoomKey, RoomKeyError};
pub use dispatcher::{DispatchCounters, DispatchStats};
pub use events::{Event, OutboundEvent};
pub use lifecycle::{ChannelStatus, LifecyclePolicy};
pub use rooms::{ConnectionId, DEFAULT_OUTBOX_CAPACITY};
pub use routing::RoomRouter;
