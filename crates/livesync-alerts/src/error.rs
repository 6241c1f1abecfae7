//! Alert rule error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Duplicate rule type: {0}")]
    DuplicateRule(String),
}

pub type AlertResult<T> = Result<T, AlertError>;
