//! `RelayServer` — Axum HTTP server carrying the WebSocket and SSE
//! adapters over one shared engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use relay_stream::{Generator, Hub, JobRegistry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::errors::Result;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::{sse, ws};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Per-session job registry.
    pub registry: Arc<JobRegistry>,
    /// Per-principal connection and cancellation tracking.
    pub hub: Arc<Hub>,
    /// Producer implementation driving new jobs.
    pub generator: Arc<dyn Generator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl AppState {
    /// Build fresh shared state for a server instance.
    pub fn new(config: ServerConfig, generator: Arc<dyn Generator>) -> Self {
        Self {
            registry: Arc::new(JobRegistry::new(config.delivery.clone())),
            hub: Arc::new(Hub::new()),
            generator,
            config: Arc::new(config),
            start_time: Instant::now(),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }
}

/// The relay server: owns the shared state and binds the listener.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Create a new server around the given producer.
    pub fn new(config: ServerConfig, generator: Arc<dyn Generator>) -> Self {
        Self {
            state: AppState::new(config, generator),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws::ws_handler))
            .route("/stream", get(sse::sse_attach).post(sse::sse_start))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve. Returns the bound address (useful with port 0) and
    /// the serve task; the task ends when the shutdown token fires.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "server exited with error");
            }
        });
        Ok((local, handle))
    }

    /// The shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The job registry.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.state.registry
    }

    /// The connection hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.total_connections(),
        state.registry.len(),
    ))
}
