//! livesync: live account dashboard pipeline.
//!
//! Main application that orchestrates all components:
//! - Push ingress over WebSocket with polling fallback
//! - Rate-limited, cached pull monitor per account
//! - Coalescing store feeding the presentation layer
//! - Alert derivation from account snapshots

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
