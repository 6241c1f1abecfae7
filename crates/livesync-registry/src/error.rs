//! Registry error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failure of one outbound call. Never escapes `RateLimitedCache::request`;
/// it is folded into `ApiStatus::Error`.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}
