use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name of the mandatory first event of every realtime connection.
pub const CONNECT_EVENT: &str = "PB_CONNECT";

/// Payload of the connect announcement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub client_id: String,
}

/// Body binding a connection to its subscription targets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSet {
    pub client_id: String,
    pub subscriptions: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Create,
    Update,
    Delete,
    /// Action missing, unreadable, or not known to this client.
    #[serde(other)]
    Unknown,
}

/// A realtime payload that could not be decoded.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
    /// Raw `data` of the offending frame.
    pub payload: String,
}

/// One record change pushed by the server.
///
/// Malformed payloads are delivered too, with `record` unset and `error`
/// describing the failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Event<T> {
    /// Server event name the change arrived under.
    pub topic: String,
    pub action: EventAction,
    pub record: Option<T>,
    pub error: Option<DecodeError>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    action: EventAction,
    #[serde(default)]
    record: Value,
}

impl<T> Event<T>
where
    T: DeserializeOwned,
{
    /// Decodes one frame's `data` into an event, never failing.
    pub fn decode(topic: &str, data: &str) -> Self {
        let raw = match serde_json::from_str::<RawEvent>(data) {
            Ok(raw) => raw,
            Err(err) => return Self::failed(topic, EventAction::Unknown, err, data),
        };

        match serde_json::from_value::<T>(raw.record) {
            Ok(record) => Self {
                topic: topic.to_string(),
                action: raw.action,
                record: Some(record),
                error: None,
            },
            Err(err) => Self::failed(topic, raw.action, err, data),
        }
    }

    fn failed(topic: &str, action: EventAction, err: serde_json::Error, data: &str) -> Self {
        Self {
            topic: topic.to_string(),
            action,
            record: None,
            error: Some(DecodeError {
                message: err.to_string(),
                payload: data.to_string(),
            }),
        }
    }
}

impl<T> Event<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.record.is_some()
    }

    /// Splits the event into its action and record, or its decode error.
    pub fn into_result(self) -> Result<(EventAction, T), DecodeError> {
        match (self.record, self.error) {
            (Some(record), None) => Ok((self.action, record)),
            (_, Some(error)) => Err(error),
            (None, None) => Err(DecodeError {
                message: "event carried no record".to_string(),
                payload: String::new(),
            }),
        }
    }
}
