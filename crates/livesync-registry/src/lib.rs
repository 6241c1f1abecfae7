//! Pull-side access for the livesync pipeline.
//!
//! This crate provides:
//! - `SlidingWindowLimiter` and `ResponseCache` (TTL + insertion-order LRU)
//! - `RateLimitedCache`: gate in front of upstream calls that never errors
//! - `AccountApi`: reqwest client for the per-account upstream API
//! - `ConnectionRegistry`: per-entity connection state and backoff
//! - `AccountMonitor`: one polling task per configured entity

pub mod cache;
pub mod client;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod rate_limited_cache;
pub mod rate_limiter;

pub use cache::{CacheEntry, ResponseCache};
pub use client::{AccountApi, AccountSource};
pub use connection::{
    ConnectionRegistry, ConnectionStatus, RateLimitStatus, ReconnectDecision, RegistryConfig,
};
pub use error::{RegistryError, RegistryResult, UpstreamError};
pub use monitor::{decode_account, decode_positions, AccountMonitor, MonitorConfig, MonitorEvent};
pub use rate_limited_cache::{
    ApiResponse, ApiStatus, RateLimitInfo, RateLimitedCache, RateLimitedCacheConfig,
};
pub use rate_limiter::SlidingWindowLimiter;
