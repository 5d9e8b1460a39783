//! NIP-01 relay wire messages
//!
//! Every frame is a JSON array whose first element names the message type.

use nostr_sdk::prelude::{Event, Filter};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

/// Client to relay
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Event(Box<Event>),
    Close(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Event(event) => json!(["EVENT", serde_json::to_value(event.as_ref())?]),
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Relay to client
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Auth(String),
}

impl RelayMessage {
    /// Parse one text frame
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let frame = value
            .as_array()
            .ok_or_else(|| malformed("frame is not an array"))?;
        let kind = frame
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing message type"))?;

        let str_at = |i: usize| -> Result<String> {
            frame
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| malformed(&format!("{}: element {} is not a string", kind, i)))
        };
        let opt_str_at = |i: usize| -> String {
            frame
                .get(i)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let message = match kind {
            "EVENT" => {
                let raw = frame
                    .get(2)
                    .ok_or_else(|| malformed("EVENT without event"))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                RelayMessage::Event {
                    subscription_id: str_at(1)?,
                    event: Box::new(event),
                }
            }
            "OK" => RelayMessage::Ok {
                event_id: str_at(1)?,
                accepted: frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| malformed("OK without status"))?,
                message: opt_str_at(3),
            },
            "EOSE" => RelayMessage::EndOfStoredEvents(str_at(1)?),
            "NOTICE" => RelayMessage::Notice(opt_str_at(1)),
            "CLOSED" => RelayMessage::Closed {
                subscription_id: str_at(1)?,
                message: opt_str_at(2),
            },
            "AUTH" => RelayMessage::Auth(opt_str_at(1)),
            other => return Err(malformed(&format!("unknown message type {}", other))),
        };
        Ok(message)
    }
}

fn malformed(detail: &str) -> BridgeError {
    BridgeError::Parse(format!("relay message: {}", detail))
}
