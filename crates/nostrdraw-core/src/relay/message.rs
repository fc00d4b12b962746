//! Relay wire messages.
//!
//! Every frame is a JSON array whose first element names the message.

use crate::event::{Event, Filter};
use serde_json::{Value, json};
use thiserror::Error;

/// Wire decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Unknown message type: {0}")]
    Unknown(String),
    #[error("Malformed {0} message")]
    Malformed(&'static str),
}

/// Messages sent from a client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an envelope.
    Event(Event),
    /// Open a subscription: stored matches, end-of-stored marker, then live.
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Close a subscription.
    Close(String),
}

/// Messages sent from a relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    /// Publish acknowledgement.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// End of stored events for a subscription.
    Eose(String),
    /// Subscription closed by the relay.
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice(String),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                frame.extend(filters.iter().map(|f| json!(f)));
                Value::Array(frame)
            }
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        value.to_string()
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let (label, rest) = split_frame(json)?;
        match label.as_str() {
            "EVENT" => {
                let event = rest.first().ok_or(MessageError::Malformed("EVENT"))?;
                let event = serde_json::from_value(event.clone()).map_err(|_| MessageError::Malformed("EVENT"))?;
                Ok(ClientMessage::Event(event))
            }
            "REQ" => {
                let (id, filters) = rest.split_first().ok_or(MessageError::Malformed("REQ"))?;
                let subscription_id = as_string(id).ok_or(MessageError::Malformed("REQ"))?;
                let filters = filters
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<Result<Vec<Filter>, _>>()
                    .map_err(|_| MessageError::Malformed("REQ"))?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                let id = rest.first().and_then(as_string).ok_or(MessageError::Malformed("CLOSE"))?;
                Ok(ClientMessage::Close(id))
            }
            other => Err(MessageError::Unknown(other.to_string())),
        }
    }
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose(subscription_id) => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
        };
        value.to_string()
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let (label, rest) = split_frame(json)?;
        match label.as_str() {
            "EVENT" => match rest.as_slice() {
                [id, event, ..] => {
                    let subscription_id = as_string(id).ok_or(MessageError::Malformed("EVENT"))?;
                    let event =
                        serde_json::from_value(event.clone()).map_err(|_| MessageError::Malformed("EVENT"))?;
                    Ok(RelayMessage::Event {
                        subscription_id,
                        event,
                    })
                }
                _ => Err(MessageError::Malformed("EVENT")),
            },
            "OK" => match rest.as_slice() {
                [id, Value::Bool(accepted), message @ ..] => Ok(RelayMessage::Ok {
                    event_id: as_string(id).ok_or(MessageError::Malformed("OK"))?,
                    accepted: *accepted,
                    message: message.first().and_then(as_string).unwrap_or_default(),
                }),
                _ => Err(MessageError::Malformed("OK")),
            },
            "EOSE" => {
                let id = rest.first().and_then(as_string).ok_or(MessageError::Malformed("EOSE"))?;
                Ok(RelayMessage::Eose(id))
            }
            "CLOSED" => {
                let id = rest.first().and_then(as_string).ok_or(MessageError::Malformed("CLOSED"))?;
                Ok(RelayMessage::Closed {
                    subscription_id: id,
                    message: rest.get(1).and_then(as_string).unwrap_or_default(),
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice(
                rest.first().and_then(as_string).unwrap_or_default(),
            )),
            other => Err(MessageError::Unknown(other.to_string())),
        }
    }
}

fn split_frame(json: &str) -> Result<(String, Vec<Value>), MessageError> {
    let frame: Vec<Value> = serde_json::from_str(json).map_err(|e| MessageError::Json(e.to_string()))?;
    let mut items = frame.into_iter();
    let label = items
        .next()
        .as_ref()
        .and_then(as_string)
        .ok_or(MessageError::Json("missing message label".to_string()))?;
    Ok((label, items.collect()))
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}
