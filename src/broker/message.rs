//! Wire envelopes
//!
//! Every frame the server sends is an `Envelope`: a type tag, a millisecond
//! timestamp, the channel (or route) it belongs to, the client's `request_id`
//! when replying to a request, and a typed payload.
//!
//! Route traffic uses three type tags per route:
//! - `<route>.subscribe.response` and `<route>.unsubscribe.response`, carrying
//!   a `SubscriptionResponse`
//! - `<route>.update`, carrying an `UpdatePayload`

use serde::{Deserialize, Serialize};

use crate::broker::topic::Topic;

/// Channel used for protocol errors, welcome and session replies.
pub const SYSTEM_CHANNEL: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(kind: impl Into<String>, channel: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            channel: channel.into(),
            request_id: None,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<V> Envelope<UpdatePayload<V>> {
    /// Build the `<route>.update` push for one produced value.
    pub fn update(route: &str, topic: &Topic, data: V) -> Self {
        Envelope::new(
            format!("{route}.update"),
            route,
            UpdatePayload {
                topic: topic.to_string(),
                data,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Reply payload for `<route>.subscribe` and `<route>.unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub status: ResponseStatus,
    pub topic: String,
    pub message: String,
}

impl SubscriptionResponse {
    pub fn subscribed(topic: &Topic) -> Self {
        Self {
            status: ResponseStatus::Ok,
            topic: topic.to_string(),
            message: "Subscribed".to_string(),
        }
    }

    pub fn unsubscribed(topic: &Topic) -> Self {
        Self {
            status: ResponseStatus::Ok,
            topic: topic.to_string(),
            message: "Unsubscribed".to_string(),
        }
    }

    /// A failed request; `topic` is empty when it could not be derived.
    pub fn error(topic: Option<&Topic>, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            topic: topic.map(Topic::to_string).unwrap_or_default(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload<V> {
    pub topic: String,
    pub data: V,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Generic error frame on the system channel.
pub fn error_envelope(message: impl Into<String>) -> Envelope<ErrorPayload> {
    Envelope::new(
        "error",
        SYSTEM_CHANNEL,
        ErrorPayload {
            message: message.into(),
        },
    )
}
