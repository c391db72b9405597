//! Topic subscription index and delivery
//!
//! `TopicHub` is the transport-facing half of the route layer: it records
//! which connections subscribe to which topic and pushes serialized frames to
//! them. It knows nothing about producers; the route handlers keep the hub and
//! the producer refcounts in step.
//!
//! Each connection's membership remembers how many times it subscribed to a
//! topic, so a disconnect can hand back exactly the number of producer
//! references that connection took.

use std::collections::{HashMap, HashSet};

use tracing::warn;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::topic::Topic;
use crate::client::{ConnectionId, Outbound};
use crate::utils::error::DeliveryError;

/// Result of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Frames dropped because a subscriber's queue was full.
    pub dropped: usize,
    /// Subscribers whose queue is closed; the caller disconnects them.
    pub closed: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct TopicHub {
    subscribers: HashMap<Topic, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashMap<Topic, usize>>,
    outbound: HashMap<ConnectionId, Outbound>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: ConnectionId, outbound: Outbound) {
        self.memberships.entry(id.clone()).or_default();
        self.outbound.insert(id, outbound);
    }

    /// Forget a connection. Returns every topic it held with the number of
    /// subscriptions it had taken on each.
    pub fn detach(&mut self, id: &ConnectionId) -> Vec<(Topic, usize)> {
        self.outbound.remove(id);
        let Some(topics) = self.memberships.remove(id) else {
            return Vec::new();
        };

        for topic in topics.keys() {
            if let Some(set) = self.subscribers.get_mut(topic) {
                set.remove(id);
                if set.is_empty() {
                    self.subscribers.remove(topic);
                }
            }
        }
        topics.into_iter().collect()
    }

    /// Register one subscription of `id` to `topic`. Repeats keep a single
    /// set entry and bump the connection's count for the topic.
    pub fn subscribe(&mut self, topic: &Topic, id: &ConnectionId) -> Option<usize> {
        let membership = self.memberships.get_mut(id)?;
        let count = membership.entry(topic.clone()).or_insert(0);
        *count += 1;
        self.subscribers
            .entry(topic.clone())
            .or_default()
            .insert(id.clone());
        Some(*count)
    }

    /// Drop one subscription of `id` to `topic`. Returns `false` when the
    /// connection held none.
    pub fn unsubscribe(&mut self, topic: &Topic, id: &ConnectionId) -> bool {
        let Some(membership) = self.memberships.get_mut(id) else {
            return false;
        };
        let Some(count) = membership.get_mut(topic) else {
            return false;
        };

        *count -= 1;
        if *count == 0 {
            membership.remove(topic);
            if let Some(set) = self.subscribers.get_mut(topic) {
                set.remove(id);
                if set.is_empty() {
                    self.subscribers.remove(topic);
                }
            }
        }
        true
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.subscribers.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers.get(topic).map_or(0, HashSet::len)
    }

    pub fn subscribers(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.subscribers
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics_of(&self, id: &ConnectionId) -> Vec<Topic> {
        self.memberships
            .get(id)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Push `message` to every current subscriber of `topic` without waiting
    /// on any of them.
    pub fn deliver(&self, topic: &Topic, message: &WsMessage) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(set) = self.subscribers.get(topic) else {
            return delivery;
        };

        for id in set {
            let Some(outbound) = self.outbound.get(id) else {
                continue;
            };
            match outbound.try_send(message.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(connection = %id, %topic, "outbound queue full, dropping update");
                    delivery.dropped += 1;
                }
                Err(DeliveryError::Closed) => delivery.closed.push(id.clone()),
            }
        }
        delivery
    }
}
