//! Error types for livesync-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed inbound envelope. Dropped with a warning by consumers.
    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Invalid payload for {kind}: {reason}")]
    Payload { kind: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
