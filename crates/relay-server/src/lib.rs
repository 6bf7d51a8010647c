//! # relay-server
//!
//! Axum HTTP server exposing the relay-stream engine over two thin
//! connection adapters:
//!
//! - `/ws` — WebSocket: full inbound command loop (`start`/`stop`/`ping`),
//!   outbound delivery with ping/pong liveness
//! - `/stream` — SSE: attach (GET) or start-and-stream (POST)
//!
//! Both adapters run against the same [`relay_stream::Job`] subscription
//! path; there is one engine, not one per transport. Also provides server
//! configuration, health reporting, and graceful shutdown via
//! `tokio::signal` + `CancellationToken`.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod sse;
pub mod ws;

pub use config::{ServerConfig, load_config};
pub use errors::ServerError;
pub use server::{AppState, RelayServer};
pub use shutdown::ShutdownCoordinator;
