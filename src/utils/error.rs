//! Error types used throughout `feedcast`.
//!
//! Each concern gets its own enum so callers can match on what actually went
//! wrong: channel policy rejections are ordinary values returned to clients,
//! while engine errors usually end up logged and turned into an error reply.

use thiserror::Error;

use crate::client::ConnectionId;

/// Errors raised by the engine core (topics, routes, broker).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Subscription parameters could not be rendered as canonical JSON.
    /// This is a programming error in a request type, not a runtime condition.
    #[error("cannot canonicalize parameters for feed '{feed}': {source}")]
    Canonicalize {
        feed: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid payload for route '{route}': {source}")]
    InvalidPayload {
        route: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request rejected by route '{route}': {source}")]
    Rejected {
        route: String,
        #[source]
        source: ProducerError,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("route '{0}' is already registered")]
    DuplicateRoute(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("broker has shut down")]
    ShuttingDown,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections produced by the channel policy checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel '{0}' not found")]
    NotFound(String),

    #[error("Channel '{0}' requires authentication")]
    AuthRequired(String),

    #[error("Channel '{0}' has reached maximum subscribers")]
    CapacityReached(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Failures reported by feed producers and poll sources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("upstream closed")]
    Closed,
}

/// Outcome of a non-blocking push into a connection's outbound queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,

    #[error("connection is closed")]
    Closed,
}

/// Problems with an inbound client frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}
