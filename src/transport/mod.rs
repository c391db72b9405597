//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! - `message`: the client → server protocol and the session reply payloads
//! - `dispatch`: routes a decoded frame to the broker and queues the reply
//! - `websocket`: the accept loop and per-connection read/write tasks

pub mod dispatch;
pub mod message;
pub mod websocket;

pub use dispatch::{ServerContext, handle_text};
pub use websocket::{serve, start_websocket_server};
