//! In-memory account API for integration tests.

use livesync_registry::{AccountSource, UpstreamError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Serves a fixed account with the configured margin level.
pub struct MockAccountSource {
    margin_level: &'static str,
    failing: AtomicBool,
    calls: AtomicU32,
}

impl MockAccountSource {
    pub fn healthy() -> Self {
        Self::with_margin_level("500")
    }

    pub fn with_margin_level(margin_level: &'static str) -> Self {
        Self {
            margin_level,
            failing: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        let source = Self::healthy();
        source.failing.store(true, Ordering::SeqCst);
        source
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AccountSource for MockAccountSource {
    async fn fetch_account_information(&self, account_id: &str) -> Result<Value, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".to_string()));
        }
        Ok(json!({
            "accountId": account_id,
            "balance": "10000",
            "equity": "9800",
            "margin": "1000",
            "freeMargin": "8800",
            "marginLevel": self.margin_level
        }))
    }

    async fn fetch_positions(&self, account_id: &str) -> Result<Value, UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".to_string()));
        }
        Ok(json!([
            {
                "positionId": format!("{account_id}-p1"),
                "symbol": "EURUSD",
                "type": "buy",
                "volume": "0.5",
                "openPrice": "1.0850"
            }
        ]))
    }
}
