//! # relay-core
//!
//! Shared types for the relay streaming engine:
//!
//! - [`events`]: wire event envelope, event kinds, and the priority
//!   classifier that governs delivery guarantees under backpressure
//! - [`commands`]: inbound client commands (`start` / `stop` / `ping`)
//! - [`ids`]: branded ID newtypes (`SessionKey`, `OwnerId`, `ConnectionId`)

#![deny(unsafe_code)]

pub mod commands;
pub mod events;
pub mod ids;

pub use commands::ClientCommand;
pub use events::{Event, EventKind, Priority};
pub use ids::{ConnectionId, OwnerId, SessionKey};
