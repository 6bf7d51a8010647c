//! # relayd
//!
//! Relay server binary — loads configuration, wires the echo producer to
//! the streaming engine, and serves WebSocket + SSE clients until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::config::{ServerConfig, load_config};
use relay_server::server::RelayServer;
use relay_stream::EchoGenerator;
use tracing_subscriber::EnvFilter;

/// Relay streaming server.
#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Relay streaming server")]
struct Cli {
    /// Host to bind (overrides config file).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config file).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(ref host) = self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(args.config.as_deref()).context("Failed to load config")?;
    let config = args.apply(config);

    let server = RelayServer::new(config, Arc::new(EchoGenerator::default()));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("relayd listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(server.registry(), vec![handle], None)
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_config_values() {
        let cli = Cli::parse_from(["relayd"]);
        let config = cli.apply(ServerConfig::default());
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from(["relayd", "--host", "0.0.0.0", "--port", "9000"]);
        let config = cli.apply(ServerConfig::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn cli_config_path_parsed() {
        let cli = Cli::parse_from(["relayd", "--config", "/etc/relay.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/relay.json")));
    }
}
