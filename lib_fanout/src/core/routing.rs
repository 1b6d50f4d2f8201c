//! Target room computation for upstream items.

use serde_json::Value;
use thiserror::Error;

use crate::core::channel::{Channel, RoomKey, RoomKeyError};
use crate::identity::RoomSalt;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("item has no '{0}' routing attribute")]
    MissingAttribute(&'static str),
    #[error(transparent)]
    InvalidRoom(#[from] RoomKeyError),
    #[error("account items cannot be routed without a room salt")]
    NoSalt,
}

/// Maps raw items to the rooms they must reach.
#[derive(Debug, Clone, Default)]
pub struct RoomRouter {
    salt: Option<RoomSalt>,
}

impl RoomRouter {
    pub fn new(salt: Option<RoomSalt>) -> Self {
        Self { salt }
    }

    pub fn targets(&self, channel: Channel, item: &Value) -> Result<Vec<RoomKey>, RouteError> {
        match channel {
            Channel::Price | Channel::Trade => {
                let id = attribute(item, "id")?;
                let mut rooms = vec![RoomKey::qualified(channel, id)?];
                if channel.has_broadcast_room() {
                    rooms.push(RoomKey::broadcast(channel)?);
                }
                Ok(rooms)
            }
            Channel::Status => Ok(vec![RoomKey::channel_wide(channel)?]),
            Channel::Account => {
                let account_id = attribute(item, "accountId")?;
                let salt = self.salt.as_ref().ok_or(RouteError::NoSalt)?;
                Ok(vec![salt.account_room(account_id)])
            }
        }
    }
}

fn attribute<'a>(item: &'a Value, name: &'static str) -> Result<&'a str, RouteError> {
    item.get(name).and_then(Value::as_str).ok_or(RouteError::MissingAttribute(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(rooms: Vec<RoomKey>) -> Vec<String> {
        rooms.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn prices_also_reach_the_broadcast_room() {
        let router = RoomRouter::default();
        let rooms = router.targets(Channel::Price, &json!({"id": "AAPL", "price": 1.0})).unwrap();
        assert_eq!(keys(rooms), vec!["price_AAPL", "price_all"]);
    }

    #[test]
    fn trades_reach_only_the_instrument_room() {
        let router = RoomRouter::default();
        let rooms = router.targets(Channel::Trade, &json!({"id": "MSFT"})).unwrap();
        assert_eq!(keys(rooms), vec!["trade_MSFT"]);
    }

    #[test]
    fn status_is_channel_wide() {
        let router = RoomRouter::default();
        let rooms = router.targets(Channel::Status, &json!({"market": "US"})).unwrap();
        assert_eq!(keys(rooms), vec!["status"]);
    }

    #[test]
    fn account_rooms_are_salted() {
        let salt = RoomSalt::new("pepper");
        let router = RoomRouter::new(Some(salt.clone()));
        let rooms = router.targets(Channel::Account, &json!({"accountId": "acc-7"})).unwrap();
        assert_eq!(rooms, vec![salt.account_room("acc-7")]);
        assert!(!rooms[0].to_string().contains("acc-7"));
    }

    #[test]
    fn missing_attributes_and_salt_are_errors() {
        let router = RoomRouter::default();
        assert!(matches!(
            router.targets(Channel::Price, &json!({"price": 1.0})),
            Err(RouteError::MissingAttribute("id"))
        ));
        assert!(matches!(
            router.targets(Channel::Account, &json!({"accountId": "a"})),
            Err(RouteError::NoSalt)
        ));
        assert!(matches!(
            router.targets(Channel::Price, &json!({"id": "bad id"})),
            Err(RouteError::InvalidRoom(_))
        ));
    }
}
