//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] livesync_ws::WsError),

    #[error("Registry error: {0}")]
    Registry(#[from] livesync_registry::RegistryError),

    #[error("Alert error: {0}")]
    Alerts(#[from] livesync_alerts::AlertError),

    #[error("Store error: {0}")]
    Store(#[from] livesync_store::StoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] livesync_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
