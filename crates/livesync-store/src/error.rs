//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to bind feed server: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Feed server failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
