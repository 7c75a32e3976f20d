//! `BowlChat` — resilient real-time chat client library.
//!
//! The [`controller`] keeps one live broker session per epoch, subscribes the
//! room and private channels through the [`subscription`] manager, and
//! reconnects with exponential [`backoff`]. Incoming messages are
//! deduplicated by the [`buffer`] and room presence is tracked by
//! [`presence`]; both are readable through [`state::ChatView`].

pub mod api;
pub mod backoff;
pub mod buffer;
pub mod client;
pub mod config;
pub mod controller;
pub mod input;
pub mod presence;
pub mod state;
pub mod subscription;
pub mod transport;
