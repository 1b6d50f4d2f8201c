use lib_fanout::RoomUpdate;
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { rooms: Vec<String> },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedData {
    pub rooms: Vec<String>,
    pub joined: Vec<String>,
    pub left: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Answer to a `subscribe` frame with the resulting room set.
    Subscribed(SubscribedData),
    Error { message: String },
}

impl ServerMessage {
    pub fn subscribed(rooms: Vec<String>, update: RoomUpdate) -> Self {
        ServerMessage::Subscribed(SubscribedData {
            rooms,
            joined: update.joined.iter().map(ToString::to_string).collect(),
            left: update.left.iter().map(ToString::to_string).collect(),
            rejected: update.rejected,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }
}
