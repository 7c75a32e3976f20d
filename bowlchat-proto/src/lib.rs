//! Shared protocol definitions for the `BowlChat` wire format.

pub mod api;
pub mod descriptor;
pub mod event;
pub mod frame;
pub mod presence;
