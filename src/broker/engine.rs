//! Broker engine
//!
//! `Broker` is the single owner of all subscription state:
//! - the topic hub (topic → subscribers) used by the route handlers
//! - the connection registry (connections, channels, authentication)
//! - the table of registered routes and their producer trackers
//!
//! It is constructed once at startup and cloned into whoever needs it; clones
//! share the same state. Route handlers and producers hold a `WeakBroker` so
//! that dropping the last `Broker` tears everything down.
//!
//! Concurrency notes:
//! - every registry sits behind a `std::sync::Mutex` that is never held across
//!   an `.await`, so each operation below is one uninterrupted step for the
//!   other tasks on the runtime
//! - fan-out only pushes into bounded per-connection queues; connections whose
//!   queue turns out to be closed are disconnected after the lock is released

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::hub::{Delivery, TopicHub};
use crate::broker::message::Envelope;
use crate::broker::route::{FeedProducer, RouteDispatch, RouteHandler, RouteStats};
use crate::broker::topic::Topic;
use crate::channels::registry::{BroadcastReport, ConnectionRegistry};
use crate::channels::ChannelCatalog;
use crate::client::{Authenticator, ChannelKey, Connection, ConnectionId, PeerInfo};
use crate::config::Settings;
use crate::utils::error::{AuthError, ChannelError, DeliveryError, EngineError};

struct BrokerInner {
    hub: Mutex<TopicHub>,
    registry: Mutex<ConnectionRegistry>,
    routes: RwLock<HashMap<String, Arc<dyn RouteDispatch>>>,
    authenticator: Authenticator,
    outbound_buffer: usize,
    max_connections: usize,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Non-owning handle held by routes and producers.
#[derive(Clone)]
pub struct WeakBroker {
    inner: Weak<BrokerInner>,
}

impl WeakBroker {
    pub fn upgrade(&self) -> Option<Broker> {
        self.inner.upgrade().map(|inner| Broker { inner })
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub peer: PeerInfo,
    pub authenticated: bool,
    pub user: Option<String>,
    pub channels: Vec<ChannelKey>,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub topics: usize,
    pub routes: Vec<RouteStats>,
}

impl Broker {
    pub fn new(settings: &Settings) -> Self {
        Self::with_catalog(settings, ChannelCatalog::default())
    }

    pub fn with_catalog(settings: &Settings, catalog: ChannelCatalog) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                hub: Mutex::new(TopicHub::new()),
                registry: Mutex::new(ConnectionRegistry::new(catalog)),
                routes: RwLock::new(HashMap::new()),
                authenticator: Authenticator::new(&settings.auth),
                outbound_buffer: settings.engine.outbound_buffer,
                max_connections: settings.engine.max_connections,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the route `name` backed by `producer`.
    pub fn register_route<P: FeedProducer>(
        &self,
        name: &str,
        producer: P,
    ) -> Result<Arc<RouteHandler<P>>, EngineError> {
        let mut routes = self.inner.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(name) {
            return Err(EngineError::DuplicateRoute(name.to_string()));
        }
        let handler = Arc::new(RouteHandler::new(name, producer, self.downgrade()));
        routes.insert(name.to_string(), handler.clone());
        info!(route = name, "route registered");
        Ok(handler)
    }

    pub fn route(&self, name: &str) -> Option<Arc<dyn RouteDispatch>> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Accept a new connection: register it everywhere and queue the welcome
    /// frame. Returns the id and the receiving end of its outbound queue.
    pub fn connect(
        &self,
        peer: PeerInfo,
    ) -> Result<(ConnectionId, mpsc::Receiver<WsMessage>), EngineError> {
        let mut registry = self.registry();
        if registry.len() >= self.inner.max_connections {
            return Err(EngineError::ConnectionLimit(self.inner.max_connections));
        }

        let (outbound, receiver) = crate::client::Outbound::channel(self.inner.outbound_buffer);
        let connection = Connection::new(peer, outbound.clone());
        let id = connection.id.clone();

        self.hub().attach(id.clone(), outbound);
        registry.register(connection);
        info!(connection = %id, "client connected");
        Ok((id, receiver))
    }

    /// Remove a connection from both registries and release every producer
    /// reference it held. Safe to call more than once.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        let removed = self.registry().remove(id).is_some();
        let topics = self.hub().detach(id);
        let held = !topics.is_empty();

        for (topic, count) in topics {
            match self.route(topic.feed_type()) {
                Some(route) => {
                    for _ in 0..count {
                        route.release(&topic);
                    }
                }
                None => warn!(%topic, "no route for topic held by disconnecting client"),
            }
        }

        if removed {
            info!(connection = %id, "client disconnected");
        }
        removed || held
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.registry().contains(id)
    }

    pub fn touch(&self, id: &ConnectionId) {
        self.registry().touch(id);
    }

    pub(crate) fn add_topic_subscriber(
        &self,
        topic: &Topic,
        id: &ConnectionId,
    ) -> Result<usize, EngineError> {
        self.hub()
            .subscribe(topic, id)
            .ok_or_else(|| EngineError::UnknownConnection(id.clone()))
    }

    pub(crate) fn remove_topic_subscriber(&self, topic: &Topic, id: &ConnectionId) -> bool {
        self.hub().unsubscribe(topic, id)
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.hub().has_subscribers(topic)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.hub().subscriber_count(topic)
    }

    pub fn topic_subscribers(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.hub().subscribers(topic)
    }

    /// Fan `envelope` out to the subscribers of `topic`.
    pub fn publish<T: Serialize>(
        &self,
        topic: &Topic,
        envelope: &Envelope<T>,
    ) -> Result<Delivery, EngineError> {
        let message = WsMessage::text(envelope.to_json()?);
        let delivery = self.hub().deliver(topic, &message);
        for id in &delivery.closed {
            debug!(connection = %id, %topic, "subscriber gone during fan-out");
            self.disconnect(id);
        }
        Ok(delivery)
    }

    /// Queue one frame for a single connection.
    pub fn send_to<T: Serialize>(
        &self,
        id: &ConnectionId,
        envelope: &Envelope<T>,
    ) -> Result<(), EngineError> {
        let message = WsMessage::text(envelope.to_json()?);
        let result = self.registry().send(id, message);
        match result {
            Ok(()) => Ok(()),
            Err(DeliveryError::Full) => {
                warn!(connection = %id, kind = %envelope.kind, "outbound queue full, dropping reply");
                Ok(())
            }
            Err(DeliveryError::Closed) => {
                self.disconnect(id);
                Err(EngineError::UnknownConnection(id.clone()))
            }
        }
    }

    pub fn subscribe_channel(
        &self,
        id: &ConnectionId,
        channel: &str,
        symbol: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.registry().subscribe(id, channel, symbol)
    }

    pub fn unsubscribe_channel(
        &self,
        id: &ConnectionId,
        channel: &str,
        symbol: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.registry().unsubscribe(id, channel, symbol)
    }

    pub fn channel_subscribers(&self, channel: &str, symbol: Option<&str>) -> Vec<ConnectionId> {
        self.registry().subscribers(channel, symbol)
    }

    /// Send `data` to every subscriber of `channel` (or of `channel` scoped
    /// to `symbol`). Subscribers whose connection is gone are disconnected.
    pub fn broadcast<T: Serialize>(
        &self,
        channel: &str,
        symbol: Option<&str>,
        data: T,
    ) -> Result<BroadcastReport, EngineError> {
        let report = self.registry().broadcast(channel, symbol, data)?;
        for id in &report.closed {
            self.disconnect(id);
        }
        Ok(report)
    }

    /// Exchange a username/password for a token.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        self.inner.authenticator.login(username, password)
    }

    /// Validate `token` and mark the connection authenticated. Returns the
    /// token's subject.
    pub fn authenticate(&self, id: &ConnectionId, token: &str) -> Result<String, AuthError> {
        let claims = self.inner.authenticator.verify(token)?;
        self.registry().authenticate(id, &claims.sub)?;
        info!(connection = %id, user = %claims.sub, "client authenticated");
        Ok(claims.sub)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let registry = self.registry();
        let connection = registry.get(id)?;
        let topics = self
            .hub()
            .topics_of(id)
            .into_iter()
            .map(|topic| topic.to_string())
            .collect();

        Some(ConnectionSnapshot {
            id: connection.id.clone(),
            created_at: connection.created_at,
            last_activity: connection.last_activity,
            peer: connection.peer.clone(),
            authenticated: connection.authenticated,
            user: connection.user.clone(),
            channels: connection.channels.iter().cloned().collect(),
            topics,
        })
    }

    pub fn stats(&self) -> BrokerStats {
        let connections = self.registry().len();
        let topics = self.hub().topic_count();
        let routes = self
            .inner
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|route| route.stats())
            .collect();
        BrokerStats {
            connections,
            topics,
            routes,
        }
    }

    /// Stop every producer on every route.
    pub fn shutdown(&self) {
        let routes: Vec<_> = self
            .inner
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for route in routes {
            route.shutdown();
        }
        info!("broker shut down");
    }

    fn hub(&self) -> MutexGuard<'_, TopicHub> {
        self.inner.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}
