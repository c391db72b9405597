//! The `client` module defines what the server knows about one connected
//! client: its identity and peer metadata, the bounded outbound queue used to
//! push frames to it, and the credential checks used to authenticate it.

pub mod auth;
pub mod connection;

pub use auth::{Authenticator, Claims};
pub use connection::{ChannelKey, Connection, ConnectionId, Outbound, PeerInfo};
