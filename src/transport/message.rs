//! Client → server protocol.
//!
//! Session and channel messages have fixed type tags and decode into
//! `ClientMessage`. Route messages are tagged `<route>.subscribe` or
//! `<route>.unsubscribe`; their payload stays raw JSON until the route
//! handler decodes it into its own request type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::BrokerStats;
use crate::poller::PollerStats;
use crate::utils::error::ProtocolError;

const SESSION_TYPES: [&str; 6] = ["subscribe", "unsubscribe", "login", "auth", "ping", "stats"];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    Unsubscribe {
        channel: String,
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    Login {
        username: String,
        password: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    Auth {
        token: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
    Stats {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Subscribe,
    Unsubscribe,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Subscribe => "subscribe",
            RouteAction::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub route: String,
    pub action: RouteAction,
    pub payload: Value,
    pub request_id: Option<String>,
}

impl RouteRequest {
    /// Type tag of the reply, e.g. `bars.subscribe.response`.
    pub fn response_type(&self) -> String {
        format!("{}.{}.response", self.route, self.action.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Client(ClientMessage),
    Route(RouteRequest),
}

/// Decode one text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    let Some(kind) = object.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::Malformed("missing string field `type`".to_string()));
    };

    if SESSION_TYPES.contains(&kind) {
        return serde_json::from_value(value.clone())
            .map(Inbound::Client)
            .map_err(|e| ProtocolError::Malformed(e.to_string()));
    }

    let Some((route, action)) = kind.rsplit_once('.') else {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    };
    let action = match action {
        "subscribe" => RouteAction::Subscribe,
        "unsubscribe" => RouteAction::Unsubscribe,
        _ => return Err(ProtocolError::UnknownType(kind.to_string())),
    };
    if route.is_empty() {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    let request_id = match object.get("request_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => {
            return Err(ProtocolError::Malformed("`request_id` must be a string".to_string()));
        }
    };

    Ok(Inbound::Route(RouteRequest {
        route: route.to_string(),
        action,
        payload: object.get("payload").cloned().unwrap_or(Value::Null),
        request_id,
    }))
}

/// Reply to a channel `subscribe` or `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub success: bool,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub broker: BrokerStats,
    pub pollers: Vec<PollerStats>,
}
