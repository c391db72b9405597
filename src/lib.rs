//! # Feedcast
//!
//! `feedcast` is an in-memory, topic-based subscription server for streaming
//! market and account data over WebSockets.
//!
//! Clients subscribe to parameterized topics on a route (`bars`, `quotes`,
//! `orderbook`, `orders`, `positions`). The first subscriber to a topic starts
//! its producer and the last one to leave stops it, so at most one producer
//! runs per topic. Alongside routes there is a small catalog of broadcast
//! channels with authentication, subscriber caps and rate limits.
//!
//! ## Core Modules
//!
//! - `broker`: topic keys, producer lifecycle, route handlers and the `Broker`
//!   that owns all subscription state.
//! - `channels`: the channel catalog and connection registry.
//! - `client`: per-connection state, outbound queues and authentication.
//! - `poller`: periodic polling of subscribed topics.
//! - `feeds`: simulated market data and brokerage behind the routes.
//! - `transport`: the WebSocket server and wire protocol.
//! - `config`: settings from files and environment.
//! - `utils`: error types and logging.
//! - `app`: wires everything together for the `server` command.

pub mod app;
pub mod broker;
pub mod channels;
pub mod client;
pub mod config;
pub mod feeds;
pub mod poller;
pub mod transport;
pub mod utils;
