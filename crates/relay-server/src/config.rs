//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given and exists, its JSON values replace defaults
//! 3. Apply `RELAY_HOST` / `RELAY_PORT` environment overrides (highest
//!    priority)

use std::path::Path;

use relay_stream::DeliveryConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, ServerError};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Delivery policy shared by all jobs.
    pub delivery: DeliveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 50,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024, // 1 MB
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Load configuration, optionally from a JSON file, with env overrides.
///
/// A missing file (or `None`) yields defaults; an unreadable or invalid
/// file is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            ServerConfig::default()
        }
        None => ServerConfig::default(),
    };

    if let Ok(host) = std::env::var("RELAY_HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("RELAY_PORT") {
        config.port = port
            .parse()
            .map_err(|e| ServerError::Config(format!("RELAY_PORT: {e}")))?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.max_connections, 50);
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.heartbeat_timeout_secs, 90);
        assert_eq!(cfg.max_message_size, 1024 * 1024);
        assert_eq!(cfg.delivery.mailbox_capacity, 256);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = ServerConfig {
            port: 8080,
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 8080);
        assert_eq!(back.host, cfg.host);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        // Unspecified fields keep defaults.
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.max_connections, 50);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_config(Some(Path::new("/nonexistent/relay.json"))).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn no_path_yields_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn file_values_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"host":"0.0.0.0","port":3000}}"#).unwrap();
        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn invalid_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("config error"));
    }
}
