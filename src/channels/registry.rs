//! Connection registry and channel broadcaster
//!
//! The registry owns every `Connection` together with two indexes over them:
//! channel → subscribers and (channel, symbol) → subscribers. The indexes are
//! always updated in the same step as the connection's own `channels` set, so
//! removing a connection can prune it everywhere.
//!
//! Subscribing runs three policy checks in order: the channel must exist, an
//! auth-only channel needs an authenticated connection, and a capped channel
//! must have room. A rejection leaves all state untouched.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Envelope, SYSTEM_CHANNEL};
use crate::channels::config::{ChannelCatalog, ChannelConfig};
use crate::client::{ChannelKey, Connection, ConnectionId};
use crate::utils::error::{AuthError, ChannelError, DeliveryError, EngineError};

/// Payload of an unsolicited channel broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMessage<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub data: T,
}

/// Payload of the frame sent right after a connection is registered.
#[derive(Debug, Clone, Serialize)]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub channels: Vec<ChannelConfig>,
    pub server_time: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    /// The channel's rate limit was hit; nothing was sent.
    pub throttled: bool,
    /// Connections found closed; the caller must disconnect them.
    pub closed: Vec<ConnectionId>,
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    sent: u32,
}

impl RateWindow {
    const LENGTH: Duration = Duration::from_secs(1);

    fn admit(&mut self, limit: u32, now: Instant) -> bool {
        if now.duration_since(self.started) >= Self::LENGTH {
            self.started = now;
            self.sent = 0;
        }
        if self.sent < limit {
            self.sent += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    catalog: ChannelCatalog,
    connections: HashMap<ConnectionId, Connection>,
    channel_subscribers: HashMap<String, HashSet<ConnectionId>>,
    symbol_subscribers: HashMap<(String, String), HashSet<ConnectionId>>,
    windows: HashMap<String, RateWindow>,
}

impl ConnectionRegistry {
    pub fn new(catalog: ChannelCatalog) -> Self {
        Self {
            catalog,
            connections: HashMap::new(),
            channel_subscribers: HashMap::new(),
            symbol_subscribers: HashMap::new(),
            windows: HashMap::new(),
        }
    }

    /// Record a new connection and greet it with the channel listing.
    pub fn register(&mut self, connection: Connection) {
        let welcome = Envelope::new(
            "welcome",
            SYSTEM_CHANNEL,
            Welcome {
                connection_id: connection.id.clone(),
                channels: self.catalog.iter().cloned().collect(),
                server_time: chrono::Utc::now().timestamp_millis(),
            },
        );
        match welcome.to_json() {
            Ok(text) => {
                if let Err(e) = connection.outbound.try_send(WsMessage::text(text)) {
                    warn!(connection = %connection.id, error = %e, "could not queue welcome");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode welcome"),
        }
        self.connections.insert(connection.id.clone(), connection);
    }

    /// Remove a connection and every index entry pointing at it.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        for key in &connection.channels {
            remove_member(&mut self.channel_subscribers, &key.channel, id);
            if let Some(symbol) = &key.symbol {
                remove_member(
                    &mut self.symbol_subscribers,
                    &(key.channel.clone(), symbol.clone()),
                    id,
                );
            }
        }
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn touch(&mut self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get_mut(id) {
            connection.touch();
        }
    }

    /// Mark a connection authenticated as `user`.
    pub fn authenticate(&mut self, id: &ConnectionId, user: &str) -> Result<(), AuthError> {
        let connection = self
            .connections
            .get_mut(id)
            .ok_or_else(|| AuthError::UnknownConnection(id.clone()))?;
        connection.authenticated = true;
        connection.user = Some(user.to_string());
        Ok(())
    }

    pub fn subscribe(
        &mut self,
        id: &ConnectionId,
        channel: &str,
        symbol: Option<&str>,
    ) -> Result<(), ChannelError> {
        let config = self
            .catalog
            .get(channel)
            .ok_or_else(|| ChannelError::NotFound(channel.to_string()))?;
        let connection = self
            .connections
            .get(id)
            .ok_or_else(|| ChannelError::UnknownConnection(id.clone()))?;

        if config.requires_auth && !connection.authenticated {
            return Err(ChannelError::AuthRequired(channel.to_string()));
        }

        let key = ChannelKey::new(channel, symbol);
        if connection.channels.contains(&key) {
            return Ok(());
        }
        if let Some(max) = config.max_subscribers {
            if !connection.holds_channel(channel) && self.subscriber_count(channel) >= max {
                return Err(ChannelError::CapacityReached(channel.to_string()));
            }
        }

        if let Some(connection) = self.connections.get_mut(id) {
            connection.channels.insert(key);
        }
        self.channel_subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone());
        if let Some(symbol) = symbol {
            self.symbol_subscribers
                .entry((channel.to_string(), symbol.to_string()))
                .or_default()
                .insert(id.clone());
        }
        debug!(connection = %id, channel, ?symbol, "channel subscribed");
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        id: &ConnectionId,
        channel: &str,
        symbol: Option<&str>,
    ) -> Result<(), ChannelError> {
        if !self.catalog.contains(channel) {
            return Err(ChannelError::NotFound(channel.to_string()));
        }
        let connection = self
            .connections
            .get_mut(id)
            .ok_or_else(|| ChannelError::UnknownConnection(id.clone()))?;

        if !connection.channels.remove(&ChannelKey::new(channel, symbol)) {
            return Ok(());
        }
        let still_held = connection.holds_channel(channel);

        if let Some(symbol) = symbol {
            remove_member(
                &mut self.symbol_subscribers,
                &(channel.to_string(), symbol.to_string()),
                id,
            );
        }
        if !still_held {
            remove_member(&mut self.channel_subscribers, &channel.to_string(), id);
        }
        debug!(connection = %id, channel, ?symbol, "channel unsubscribed");
        Ok(())
    }

    /// Connections subscribed to `channel` as a whole.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channel_subscribers.get(channel).map_or(0, HashSet::len)
    }

    /// Who receives a broadcast on `channel` scoped to `symbol`: everyone on
    /// the channel when unscoped, otherwise the symbol's subscribers plus the
    /// connections that took the whole channel.
    pub fn subscribers(&self, channel: &str, symbol: Option<&str>) -> Vec<ConnectionId> {
        let Some(members) = self.channel_subscribers.get(channel) else {
            return Vec::new();
        };
        let Some(symbol) = symbol else {
            return members.iter().cloned().collect();
        };

        let whole_channel = ChannelKey::new(channel, None);
        let mut targets: HashSet<ConnectionId> = members
            .iter()
            .filter(|id| {
                self.connections
                    .get(*id)
                    .is_some_and(|c| c.channels.contains(&whole_channel))
            })
            .cloned()
            .collect();
        if let Some(scoped) = self
            .symbol_subscribers
            .get(&(channel.to_string(), symbol.to_string()))
        {
            targets.extend(scoped.iter().cloned());
        }
        targets.into_iter().collect()
    }

    /// Queue one frame for a single connection.
    pub fn send(&self, id: &ConnectionId, message: WsMessage) -> Result<(), DeliveryError> {
        match self.connections.get(id) {
            Some(connection) => connection.outbound.try_send(message),
            None => Err(DeliveryError::Closed),
        }
    }

    /// Send `data` on `channel` to its current subscribers. Closed
    /// connections are reported back rather than aborting the loop.
    pub fn broadcast<T: Serialize>(
        &mut self,
        channel: &str,
        symbol: Option<&str>,
        data: T,
    ) -> Result<BroadcastReport, EngineError> {
        let config = self
            .catalog
            .get(channel)
            .ok_or_else(|| ChannelError::NotFound(channel.to_string()))?;
        let limit = config.rate_limit;

        let mut report = BroadcastReport::default();
        if limit > 0 {
            let now = Instant::now();
            let window = self
                .windows
                .entry(channel.to_string())
                .or_insert(RateWindow {
                    started: now,
                    sent: 0,
                });
            if !window.admit(limit, now) {
                debug!(channel, "broadcast throttled");
                report.throttled = true;
                return Ok(report);
            }
        }

        let envelope = Envelope::new(
            channel,
            channel,
            ChannelMessage {
                symbol: symbol.map(str::to_string),
                data,
            },
        );
        let message = WsMessage::text(envelope.to_json()?);

        for id in self.subscribers(channel, symbol) {
            match self.send(&id, message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(connection = %id, channel, "outbound queue full, dropping broadcast");
                    report.dropped += 1;
                }
                Err(DeliveryError::Closed) => report.closed.push(id),
            }
        }
        Ok(report)
    }
}

fn remove_member<K>(index: &mut HashMap<K, HashSet<ConnectionId>>, key: &K, id: &ConnectionId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(set) = index.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }
}
