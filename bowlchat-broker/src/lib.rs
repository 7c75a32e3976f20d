//! `BowlChat` development broker library.
//!
//! Exposes the broker for use in tests and embedding: a token endpoint that
//! issues single-use connection tokens, a send endpoint that publishes
//! messages, and a WebSocket pub/sub endpoint with presence and heartbeats.

pub mod broker;
pub mod config;
pub mod http;
