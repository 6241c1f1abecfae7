//! Push transport for the livesync pipeline.
//!
//! Provides one resilient WebSocket connection with:
//! - Bounded reconnection (fixed interval or exponential backoff)
//! - Application-level PING/PONG heartbeat with timeout detection
//! - Fallback polling while the connection is down
//! - Decoded `Message`s forwarded over an mpsc channel, status over watch

pub mod connection;
pub mod error;
pub mod heartbeat;

pub use connection::{FallbackSource, IngressConfig, StreamIngress};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
