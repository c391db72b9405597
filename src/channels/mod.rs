//! Non-parameterized broadcast channels.
//!
//! Unlike route topics, channels are a fixed catalog of named categories.
//! Clients subscribe by name (optionally narrowed to one symbol), some
//! channels are reserved for authenticated connections, and some cap their
//! subscriber count.

pub mod config;
pub mod registry;

pub use config::{ChannelCatalog, ChannelConfig};
pub use registry::{BroadcastReport, ChannelMessage, ConnectionRegistry, Welcome};
