//! Periodic polling broadcaster
//!
//! Some feeds are cheaper to poll on a timer than to run as one producer per
//! topic. A `PollingBroadcaster` walks a fixed list of targets every tick and
//! only asks its `PollSource` for a value when the target topic currently has
//! subscribers.

pub mod broadcaster;

use serde::Serialize;

use crate::utils::error::ProducerError;

pub use broadcaster::{PollerStats, PollingBroadcaster, TickReport};

/// Something a poller can ask for the current value of one target.
pub trait PollSource: Send + Sync + 'static {
    type Request: Serialize + Send + Sync + 'static;
    type Value: Serialize + Send + 'static;

    /// Route whose topics and `<route>.update` frames the values belong to.
    fn route(&self) -> &str;

    fn poll(&self, request: &Self::Request) -> Result<Self::Value, ProducerError>;
}

/// Type-erased view of a running poller, for health reporting and shutdown.
pub trait Poller: Send + Sync {
    fn stats(&self) -> PollerStats;

    fn stop(&self);
}
