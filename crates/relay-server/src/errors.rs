//! Server error types.

/// Errors from server setup and configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration file was present but invalid.
    #[error("config error: {0}")]
    Config(String),

    /// I/O failure (bind, file read).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = ServerError::Config("port out of range".into());
        assert_eq!(err.to_string(), "config error: port out of range");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: ServerError = io.into();
        assert!(err.to_string().contains("in use"));
    }
}
