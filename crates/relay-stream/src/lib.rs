//! # relay-stream
//!
//! The streaming job/broadcast engine. One transport-agnostic core serves
//! every connection adapter:
//!
//! - [`job`]: the unit of broadcast — cancellation handle, append-only
//!   history, dynamic subscriber mailboxes, priority-tiered delivery
//! - [`registry`]: concurrency-safe keyed store enforcing
//!   at-most-one-active-job-per-session
//! - [`hub`]: per-principal connection tracking and cancellation routing
//! - [`producer`]: the [`producer::Generator`] contract plus the
//!   panic-safe, cancellation-aware task that runs it
//! - [`delivery`]: mailbox capacities and per-tier send budgets

#![deny(unsafe_code)]

pub mod delivery;
pub mod errors;
pub mod hub;
pub mod job;
pub mod producer;
pub mod registry;

pub use delivery::DeliveryConfig;
pub use errors::GenerateError;
pub use hub::Hub;
pub use job::{Job, JobState, Subscription};
pub use producer::{EchoGenerator, GenerateContext, GenerateInput, Generator, JobEmitter, run_job};
pub use registry::JobRegistry;
