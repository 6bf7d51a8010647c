//! Engine error types.

/// Errors a generation producer can return.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// The producer observed its cancellation token and stopped early.
    #[error("generation cancelled")]
    Cancelled,

    /// The generation engine failed.
    #[error("generation failed: {0}")]
    Failed(String),
}

impl GenerateError {
    /// Error category string for event emission.
    #[must_use]
    pub fn category(&self) -> &str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}
