//! Connection state
//!
//! A `Connection` is created when a client completes the WebSocket handshake
//! and is owned by the connection registry until disconnect. The transport
//! keeps only the receiving half of the outbound queue; everything that wants
//! to talk to the client goes through `Outbound`.

use std::collections::HashSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::utils::error::DeliveryError;

pub type ConnectionId = String;

/// Peer metadata captured during the handshake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerInfo {
    pub address: Option<SocketAddr>,
    pub user_agent: Option<String>,
}

/// A channel subscription, optionally narrowed to one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelKey {
    pub channel: String,
    pub symbol: Option<String>,
}

impl ChannelKey {
    pub fn new(channel: &str, symbol: Option<&str>) -> Self {
        Self {
            channel: channel.to_string(),
            symbol: symbol.map(str::to_string),
        }
    }
}

/// Sending half of a connection's bounded outbound queue.
///
/// Pushes never wait: when the queue is full the frame is dropped for this
/// connection only, so one stalled reader cannot hold up a fan-out loop.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender: mpsc::Sender<WsMessage>,
}

impl Outbound {
    /// Create a queue holding at most `capacity` frames.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn try_send(&self, message: WsMessage) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub peer: PeerInfo,
    pub authenticated: bool,
    /// Subject of the validated credential, once authenticated.
    pub user: Option<String>,
    pub channels: HashSet<ChannelKey>,
    pub outbound: Outbound,
}

impl Connection {
    /// Create a new, unauthenticated connection with a fresh UUID.
    pub fn new(peer: PeerInfo, outbound: Outbound) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
            peer,
            authenticated: false,
            user: None,
            channels: HashSet::new(),
            outbound,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Whether any subscription (scoped or not) remains for `channel`.
    pub fn holds_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|key| key.channel == channel)
    }
}
