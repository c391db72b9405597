//! Generic subscription routes
//!
//! A `RouteHandler<P>` terminates the subscribe/unsubscribe/update protocol
//! for one feed type. The request and value shapes come from the producer's
//! associated types, so each feed type is just another instantiation of the
//! same handler.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::engine::{Broker, WeakBroker};
use crate::broker::hub::Delivery;
use crate::broker::lifecycle::{EmitSink, Emitter, Ensure, ProducerTracker, Release, StopHook};
use crate::broker::message::{Envelope, SubscriptionResponse};
use crate::broker::topic::Topic;
use crate::client::ConnectionId;
use crate::utils::error::{EngineError, ProducerError};

/// A source of values for parameterized topics.
///
/// `validate` runs before anything is subscribed; a rejected request leaves
/// no trace. `create_topic` returns the producer body; it runs until it
/// finishes or is cancelled by the tracker and pushes values through `emit`.
/// `remove_topic` is called once the producer for `topic` has stopped.
pub trait FeedProducer: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Value: Serialize + Send + 'static;

    fn validate(&self, _request: &Self::Request) -> Result<(), ProducerError> {
        Ok(())
    }

    fn create_topic(
        &self,
        topic: Topic,
        request: Self::Request,
        emit: Emitter<Self::Value>,
    ) -> BoxFuture<'static, Result<(), ProducerError>>;

    fn remove_topic(&self, _topic: &Topic) {}
}

/// Per-route counters for health introspection.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub route: String,
    pub active_topics: usize,
    pub producers_started: u64,
}

/// Route operations with the request payload still in JSON form, so the
/// transport can dispatch by route name.
pub trait RouteDispatch: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe_json(
        &self,
        conn: &ConnectionId,
        payload: Value,
    ) -> Result<SubscriptionResponse, EngineError>;

    fn unsubscribe_json(
        &self,
        conn: &ConnectionId,
        payload: Value,
    ) -> Result<SubscriptionResponse, EngineError>;

    /// Return one reference on `topic`, used when a subscriber disconnects.
    fn release(&self, topic: &Topic) -> Release;

    fn stats(&self) -> RouteStats;

    fn shutdown(&self);
}

pub struct RouteHandler<P: FeedProducer> {
    name: String,
    producer: Arc<P>,
    tracker: ProducerTracker<P::Value>,
    broker: WeakBroker,
}

impl<P: FeedProducer> RouteHandler<P> {
    pub(crate) fn new(name: &str, producer: P, broker: WeakBroker) -> Self {
        let producer = Arc::new(producer);

        let sink: EmitSink<P::Value> = {
            let broker = broker.clone();
            let route = name.to_string();
            Arc::new(move |topic: &Topic, value: P::Value| {
                if let Some(broker) = broker.upgrade() {
                    publish_update(&broker, &route, topic, value);
                }
            })
        };
        let on_stop: StopHook = {
            let producer = producer.clone();
            Arc::new(move |topic: &Topic| producer.remove_topic(topic))
        };

        Self {
            name: name.to_string(),
            tracker: ProducerTracker::new(name, sink).with_stop_hook(on_stop),
            producer,
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_for(&self, request: &P::Request) -> Result<Topic, EngineError> {
        Topic::new(&self.name, request)
    }

    pub fn tracker(&self) -> &ProducerTracker<P::Value> {
        &self.tracker
    }

    /// Subscribe `conn` to the topic named by `request`, starting its
    /// producer if this is the first subscription.
    pub fn subscribe(
        &self,
        conn: &ConnectionId,
        request: P::Request,
    ) -> Result<SubscriptionResponse, EngineError> {
        let topic = self.topic_for(&request)?;
        self.producer
            .validate(&request)
            .map_err(|source| EngineError::Rejected {
                route: self.name.clone(),
                source,
            })?;
        let broker = self.broker()?;
        broker.add_topic_subscriber(&topic, conn)?;

        let producer = self.producer.clone();
        let outcome = self.tracker.ensure(&topic, move |topic, emit| {
            producer.create_topic(topic, request, emit)
        });
        if let Ensure::Joined(refcount) = outcome {
            debug!(route = %self.name, %topic, %conn, refcount, "subscribed to running topic");
        }
        Ok(SubscriptionResponse::subscribed(&topic))
    }

    pub fn unsubscribe(
        &self,
        conn: &ConnectionId,
        request: P::Request,
    ) -> Result<SubscriptionResponse, EngineError> {
        let topic = self.topic_for(&request)?;
        let broker = self.broker()?;

        if broker.remove_topic_subscriber(&topic, conn) {
            self.tracker.release(&topic);
        } else {
            debug!(route = %self.name, %topic, %conn, "unsubscribe for a topic not held");
        }
        Ok(SubscriptionResponse::unsubscribed(&topic))
    }

    /// Deliver one value to every current subscriber of `topic`.
    pub fn update(&self, topic: &Topic, value: P::Value) -> Delivery {
        match self.broker.upgrade() {
            Some(broker) => publish_update(&broker, &self.name, topic, value),
            None => Delivery::default(),
        }
    }

    fn broker(&self) -> Result<Broker, EngineError> {
        self.broker.upgrade().ok_or(EngineError::ShuttingDown)
    }

    fn decode(&self, payload: Value) -> Result<P::Request, EngineError> {
        serde_json::from_value(payload).map_err(|source| EngineError::InvalidPayload {
            route: self.name.clone(),
            source,
        })
    }
}

impl<P: FeedProducer> RouteDispatch for RouteHandler<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe_json(
        &self,
        conn: &ConnectionId,
        payload: Value,
    ) -> Result<SubscriptionResponse, EngineError> {
        let request = self.decode(payload)?;
        self.subscribe(conn, request)
    }

    fn unsubscribe_json(
        &self,
        conn: &ConnectionId,
        payload: Value,
    ) -> Result<SubscriptionResponse, EngineError> {
        let request = self.decode(payload)?;
        self.unsubscribe(conn, request)
    }

    fn release(&self, topic: &Topic) -> Release {
        self.tracker.release(topic)
    }

    fn stats(&self) -> RouteStats {
        RouteStats {
            route: self.name.clone(),
            active_topics: self.tracker.topics().len(),
            producers_started: self.tracker.started(),
        }
    }

    fn shutdown(&self) {
        self.tracker.shutdown();
    }
}

fn publish_update<V: Serialize>(broker: &Broker, route: &str, topic: &Topic, value: V) -> Delivery {
    let envelope = Envelope::update(route, topic, value);
    match broker.publish(topic, &envelope) {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!(%route, %topic, error = %e, "failed to publish update");
            Delivery::default()
        }
    }
}
