//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is answering.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open client connections across all transports.
    pub connections: usize,
    /// Jobs currently registered (running or not yet evicted).
    pub active_jobs: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, jobs: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_jobs: jobs,
    }
}
