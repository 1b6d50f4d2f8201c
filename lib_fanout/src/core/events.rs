//! # Typed Channel Items
//!
//! Every channel carries one item type. Upstream payloads are JSON and may hold
//! either a single item or a batch; both shapes normalize to a list of raw
//! items, which are only decoded into their typed form once the dispatcher
//! knows somebody is listening.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::channel::Channel;

/// A single instrument quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub id: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_volume: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_hours: Option<String>,
    /// Exchange timestamp, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTick {
    pub id: String,
    pub price: f64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

/// Market session status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStatusUpdate {
    pub market: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_change: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

/// An event that belongs to one trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    pub account_id: String,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

/// A decoded item of any channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Price(PriceUpdate),
    Trade(TradeTick),
    Status(MarketStatusUpdate),
    Account(AccountUpdate),
}

impl Event {
    /// Decodes one raw item with the decoder registered for `channel`.
    pub fn decode(channel: Channel, raw: Value) -> Result<Event, serde_json::Error> {
        Ok(match channel {
            Channel::Price => Event::Price(serde_json::from_value(raw)?),
            Channel::Trade => Event::Trade(serde_json::from_value(raw)?),
            Channel::Status => Event::Status(serde_json::from_value(raw)?),
            Channel::Account => Event::Account(serde_json::from_value(raw)?),
        })
    }

    pub fn channel(&self) -> Channel {
        match self {
            Event::Price(_) => Channel::Price,
            Event::Trade(_) => Channel::Trade,
            Event::Status(_) => Channel::Status,
            Event::Account(_) => Channel::Account,
        }
    }
}

/// Upstream payload shape: one item or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Batch {
    Many(Vec<Value>),
    One(Value),
}

/// Normalizes a payload to a list of raw items.
pub fn split_batch(payload: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    Ok(match serde_json::from_slice::<Batch>(payload)? {
        Batch::Many(items) => items,
        Batch::One(item) => vec![item],
    })
}

#[derive(Serialize)]
struct Frame<'a> {
    event: &'a str,
    data: &'a Event,
}

/// An event serialized once and shared by every recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub channel: Channel,
    /// `{"event": "<channel>", "data": <item>}`
    pub frame: String,
}

impl OutboundEvent {
    pub fn encode(event: &Event) -> Result<Arc<OutboundEvent>, serde_json::Error> {
        let channel = event.channel();
        let frame = serde_json::to_string(&Frame { event: channel.name(), data: event })?;
        Ok(Arc::new(OutboundEvent { channel, frame }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_item_and_batch_normalize_to_a_list() {
        let one = split_batch(br#"{"id":"a","price":1.0}"#).unwrap();
        assert_eq!(one.len(), 1);

        let many = split_batch(br#"[{"id":"a","price":1.0},{"id":"b","price":2.0}]"#).unwrap();
        assert_eq!(many.len(), 2);

        assert!(split_batch(b"not json").is_err());
    }

    #[test]
    fn decode_uses_the_channel_item_type() {
        let event = Event::decode(Channel::Price, json!({"id": "AAPL", "price": 190.5})).unwrap();
        assert_eq!(event.channel(), Channel::Price);

        // A trade needs a size; a price-shaped item must not decode as one.
        assert!(Event::decode(Channel::Trade, json!({"id": "AAPL", "price": 190.5})).is_err());
    }

    #[test]
    fn outbound_frame_carries_event_name_and_item() {
        let event = Event::Account(AccountUpdate {
            account_id: "acc-1".into(),
            kind: "fill".into(),
            data: json!({"qty": 10}),
            time: None,
        });
        let out = OutboundEvent::encode(&event).unwrap();
        let parsed: Value = serde_json::from_str(&out.frame).unwrap();
        assert_eq!(parsed["event"], "account");
        assert_eq!(parsed["data"]["accountId"], "acc-1");
        assert_eq!(parsed["data"]["data"]["qty"], 10);
    }
}
