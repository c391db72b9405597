//! The subscription engine.
//!
//! - `topic`: canonical topic identity for a feed type and its parameters
//! - `message`: the wire envelope and route reply payloads
//! - `hub`: topic → subscribers index and non-blocking fan-out
//! - `lifecycle`: one producer per topic, reference counted
//! - `route`: the generic subscribe/unsubscribe/update handler per feed type
//! - `engine`: `Broker`, the owner of all of the above plus the channel registry

pub mod engine;
pub mod hub;
pub mod lifecycle;
pub mod message;
pub mod route;
pub mod topic;

pub use engine::{Broker, BrokerStats, ConnectionSnapshot, WeakBroker};
pub use lifecycle::{Emitter, ProducerTracker};
pub use message::{Envelope, ResponseStatus, SubscriptionResponse, UpdatePayload};
pub use route::{FeedProducer, RouteDispatch, RouteHandler};
pub use topic::Topic;

#[cfg(test)]
mod tests;
