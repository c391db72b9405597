//! Shared utilities: the error taxonomy and logging setup used across the
//! engine, the channel layer and the transport.

pub mod error;
pub mod logging;
