//! # Channels and Room Keys
//!
//! A `Channel` is one of the fixed upstream feeds. A `RoomKey` is an addressable
//! interest group inside a channel: either the whole channel (`status`) or the
//! channel plus a qualifier (`price_AAPL`, `price_all`, `account_<hash>`).
//!
//! Room keys arrive as plain strings from clients, so parsing is strict: a key
//! must name a known channel, carry a qualifier exactly when that channel needs
//! one, and keep the qualifier within a conservative character set.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Separator between the channel name and the qualifier in a room key.
pub const ROOM_SEPARATOR: char = '_';

/// Qualifier of the broadcast room that receives every item of a channel.
pub const BROADCAST_QUALIFIER: &str = "all";

const MAX_QUALIFIER_LEN: usize = 64;

/// The closed set of upstream feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Instrument quotes, routed by instrument id plus the broadcast room.
    Price,
    /// Executed trades, routed by instrument id.
    Trade,
    /// Market session status, a single channel-wide room.
    Status,
    /// Per-account events, routed to salted account rooms.
    Account,
}

impl Channel {
    /// Every channel, in a stable order.
    pub const ALL: [Channel; 4] = [Channel::Price, Channel::Trade, Channel::Status, Channel::Account];

    /// Wire name, used for room keys, outbound event names and topic names.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Price => "price",
            Channel::Trade => "trade",
            Channel::Status => "status",
            Channel::Account => "account",
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Whether rooms in this channel carry a qualifier.
    pub fn is_qualified(self) -> bool {
        !matches!(self, Channel::Status)
    }

    /// Whether every item is also sent to the `<channel>_all` room.
    pub fn has_broadcast_room(self) -> bool {
        matches!(self, Channel::Price)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a room key string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomKeyError {
    #[error("room key is empty")]
    Empty,
    #[error("room key '{0}' does not name a known channel")]
    UnknownChannel(String),
    #[error("channel '{0}' requires a qualifier")]
    MissingQualifier(Channel),
    #[error("channel '{0}' does not take a qualifier")]
    UnexpectedQualifier(Channel),
    #[error("invalid room qualifier '{0}'")]
    InvalidQualifier(String),
}

/// An addressable interest group: a channel plus an optional qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    channel: Channel,
    qualifier: Option<String>,
}

impl RoomKey {
    /// The single room of an unqualified channel.
    pub fn channel_wide(channel: Channel) -> Result<Self, RoomKeyError> {
        if channel.is_qualified() {
            return Err(RoomKeyError::MissingQualifier(channel));
        }
        Ok(Self { channel, qualifier: None })
    }

    pub fn qualified(channel: Channel, qualifier: impl Into<String>) -> Result<Self, RoomKeyError> {
        let qualifier = qualifier.into();
        if !channel.is_qualified() {
            return Err(RoomKeyError::UnexpectedQualifier(channel));
        }
        if !is_valid_qualifier(&qualifier) {
            return Err(RoomKeyError::InvalidQualifier(qualifier));
        }
        Ok(Self { channel, qualifier: Some(qualifier) })
    }

    /// Key for a qualifier produced by the broker itself (hex digests).
    pub(crate) fn from_digest(channel: Channel, digest: String) -> Self {
        debug_assert!(is_valid_qualifier(&digest));
        Self { channel, qualifier: Some(digest) }
    }

    /// The `<channel>_all` room.
    pub fn broadcast(channel: Channel) -> Result<Self, RoomKeyError> {
        Self::qualified(channel, BROADCAST_QUALIFIER)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }
}

impl FromStr for RoomKey {
    type Err = RoomKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() {
            return Err(RoomKeyError::Empty);
        }
        let (name, qualifier) = match raw.split_once(ROOM_SEPARATOR) {
            Some((name, qualifier)) => (name, Some(qualifier)),
            None => (raw, None),
        };
        let channel =
            Channel::from_name(name).ok_or_else(|| RoomKeyError::UnknownChannel(raw.to_string()))?;
        match qualifier {
            Some(q) => RoomKey::qualified(channel, q),
            None => RoomKey::channel_wide(channel),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}{}{}", self.channel, ROOM_SEPARATOR, q),
            None => f.write_str(self.channel.name()),
        }
    }
}

/// Instrument symbols (`BRK.B`, `^GSPC`, `EURUSD=X`, `ES=F`) and hex digests.
fn is_valid_qualifier(q: &str) -> bool {
    !q.is_empty()
        && q.len() <= MAX_QUALIFIER_LEN
        && q.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '^' | '=' | ':' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_and_channel_wide_keys() {
        let key: RoomKey = "price_AAPL".parse().unwrap();
        assert_eq!(key.channel(), Channel::Price);
        assert_eq!(key.qualifier(), Some("AAPL"));

        let key: RoomKey = "status".parse().unwrap();
        assert_eq!(key.channel(), Channel::Status);
        assert_eq!(key.qualifier(), None);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["price_all", "trade_BRK.B", "status", "price_^GSPC", "price_EURUSD=X"] {
            let key: RoomKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!("".parse::<RoomKey>(), Err(RoomKeyError::Empty));
        assert!(matches!("quotes_a".parse::<RoomKey>(), Err(RoomKeyError::UnknownChannel(_))));
        assert!(matches!("pricex_a".parse::<RoomKey>(), Err(RoomKeyError::UnknownChannel(_))));
        assert_eq!("price".parse::<RoomKey>(), Err(RoomKeyError::MissingQualifier(Channel::Price)));
        assert_eq!(
            "status_open".parse::<RoomKey>(),
            Err(RoomKeyError::UnexpectedQualifier(Channel::Status))
        );
        assert!(matches!("price_".parse::<RoomKey>(), Err(RoomKeyError::InvalidQualifier(_))));
        assert!(matches!("price_a b".parse::<RoomKey>(), Err(RoomKeyError::InvalidQualifier(_))));
        let long = format!("price_{}", "x".repeat(65));
        assert!(matches!(long.parse::<RoomKey>(), Err(RoomKeyError::InvalidQualifier(_))));
    }

    #[test]
    fn channel_names_are_unique() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_name(channel.name()), Some(channel));
        }
        assert_eq!(Channel::from_name("prices"), None);
    }
}
