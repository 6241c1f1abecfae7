//! Gate and cache for pull-based upstream calls.
//!
//! `request` never returns `Err`: a fresh cache hit, a rate-limited refusal,
//! an upstream failure and a timeout are all encoded in `ApiResponse::status`.

use crate::cache::ResponseCache;
use crate::error::UpstreamError;
use crate::rate_limiter::SlidingWindowLimiter;
use chrono::{DateTime, Utc};
use livesync_core::SharedClock;
use livesync_telemetry::Metrics;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome class of a gated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Success,
    Error,
    RateLimited,
}

/// Limiter state reported with every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds until the oldest request leaves the window.
    #[serde(rename = "reset")]
    pub reset_ms: u64,
}

impl RateLimitInfo {
    pub fn reset_in(&self) -> Duration {
        Duration::from_millis(self.reset_ms)
    }
}

/// Result envelope of `RateLimitedCache::request`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<V> {
    pub data: Option<V>,
    pub status: ApiStatus,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub rate_limit: RateLimitInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
}

impl<V> ApiResponse<V> {
    pub fn is_success(&self) -> bool {
        self.status == ApiStatus::Success
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == ApiStatus::RateLimited
    }

    /// Transform the payload, keeping status and metadata.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> ApiResponse<U> {
        ApiResponse {
            data: self.data.map(f),
            status: self.status,
            cached: self.cached,
            timestamp: self.timestamp,
            rate_limit: self.rate_limit,
            error: self.error,
            correlation_id: self.correlation_id,
        }
    }
}

/// Limiter and cache settings.
#[derive(Debug, Clone)]
pub struct RateLimitedCacheConfig {
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub request_timeout: Duration,
    pub default_ttl: Duration,
    pub max_size: usize,
}

impl Default for RateLimitedCacheConfig {
    fn default() -> Self {
        Self {
            rate_limit_requests: 60,
            rate_limit_window: Duration::from_millis(60_000),
            request_timeout: Duration::from_millis(10_000),
            default_ttl: Duration::from_millis(5_000),
            max_size: 100,
        }
    }
}

/// Sliding-window limiter plus TTL/LRU cache in front of an upstream API.
///
/// The limiter and the cache belong to this instance only.
pub struct RateLimitedCache<V> {
    limiter: SlidingWindowLimiter,
    cache: ResponseCache<V>,
    request_timeout: Duration,
    default_ttl: Duration,
    clock: SharedClock,
}

impl<V: Clone + Send + Sync + 'static> RateLimitedCache<V> {
    pub fn new(config: RateLimitedCacheConfig, clock: SharedClock) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(config.rate_limit_requests, config.rate_limit_window),
            cache: ResponseCache::new(config.max_size),
            request_timeout: config.request_timeout,
            default_ttl: config.default_ttl,
            clock,
        }
    }

    /// Serve `key` from cache, or call `fetch` if the rate window permits.
    ///
    /// `ttl` falls back to the configured default. The window slot is
    /// recorded before the call, so a call that times out still consumes it.
    pub async fn request<F, Fut>(&self, key: &str, ttl: Option<Duration>, fetch: F) -> ApiResponse<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, UpstreamError>>,
    {
        if let Some(data) = self.cache.get(key) {
            debug!(key, "Cache hit");
            Metrics::api_request("hit");
            return self.respond(Some(data), ApiStatus::Success, true, None);
        }

        if !self.limiter.try_acquire() {
            let info = self.rate_limit_info();
            warn!(key, reset_ms = info.reset_ms, "Request rate limited");
            Metrics::api_request("rate_limited");
            return self.respond(
                None,
                ApiStatus::RateLimited,
                false,
                Some(format!("rate limited, retry in {}ms", info.reset_ms)),
            );
        }

        Metrics::api_request("miss");
        let outcome = match tokio::time::timeout(self.request_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.request_timeout)),
        };

        match outcome {
            Ok(data) => {
                self.cache
                    .insert(key, data.clone(), ttl.unwrap_or(self.default_ttl));
                self.respond(Some(data), ApiStatus::Success, false, None)
            }
            Err(e) => {
                warn!(key, error = %e, "Upstream request failed");
                Metrics::api_request("error");
                self.respond(None, ApiStatus::Error, false, Some(e.to_string()))
            }
        }
    }

    /// Check the limiter without recording.
    pub fn can_make_request(&self) -> bool {
        self.limiter.can_make_request()
    }

    pub fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            limit: self.limiter.limit(),
            remaining: self.limiter.remaining(),
            reset_ms: self.limiter.reset_in().as_millis() as u64,
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Drop expired entries now.
    pub fn sweep(&self) -> usize {
        self.cache.sweep_expired()
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.limiter.reset();
    }

    /// Run the TTL sweep every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = this.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }

    fn respond(
        &self,
        data: Option<V>,
        status: ApiStatus,
        cached: bool,
        error: Option<String>,
    ) -> ApiResponse<V> {
        ApiResponse {
            data,
            status,
            cached,
            timestamp: self.clock.now(),
            rate_limit: self.rate_limit_info(),
            error,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_core::{Clock, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gate(max: u32, window_ms: u64) -> (RateLimitedCache<u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RateLimitedCacheConfig {
            rate_limit_requests: max,
            rate_limit_window: Duration::from_millis(window_ms),
            request_timeout: Duration::from_millis(100),
            default_ttl: Duration::from_millis(1_000),
            max_size: 10,
        };
        (RateLimitedCache::new(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (gate, _clock) = gate(5, 60_000);
        let calls = AtomicU32::new(0);

        let first = gate
            .request("k", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(first.status, ApiStatus::Success);
        assert!(!first.cached);
        assert_eq!(first.data, Some(7));
        assert_eq!(first.rate_limit.remaining, 4);

        let second = gate
            .request("k", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await;
        assert!(second.cached);
        assert_eq!(second.data, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_window_returns_rate_limited_without_call() {
        let (gate, _clock) = gate(2, 1_000);
        let calls = AtomicU32::new(0);

        for key in ["a", "b"] {
            let resp = gate
                .request(key, None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
            assert!(resp.is_success());
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        let limited = gate
            .request("c", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert_eq!(limited.status, ApiStatus::RateLimited);
        assert!(limited.data.is_none());
        assert_eq!(limited.rate_limit.remaining, 0);
        assert_eq!(limited.rate_limit.reset_ms, 800);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Still two recorded: the refused call did not consume a slot.
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(gate.can_make_request());
        assert_eq!(gate.rate_limit_info().remaining, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_exhausted_window() {
        let (gate, _clock) = gate(1, 60_000);
        gate.request("k", None, || async { Ok(1) }).await;

        let resp = gate.request("k", None, || async { Ok(2) }).await;
        assert!(resp.is_success());
        assert!(resp.cached);
    }

    #[tokio::test]
    async fn test_upstream_error_is_encoded() {
        let (gate, _clock) = gate(5, 60_000);
        let resp = gate
            .request("k", None, || async {
                Err(UpstreamError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            })
            .await;

        assert_eq!(resp.status, ApiStatus::Error);
        assert!(resp.error.as_deref().is_some_and(|e| e.contains("503")));
        assert_eq!(gate.cached_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_consumes_slot() {
        let (gate, _clock) = gate(2, 60_000);
        let resp = gate
            .request("slow", None, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;

        assert_eq!(resp.status, ApiStatus::Error);
        assert!(resp.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert_eq!(resp.rate_limit.remaining, 1);
    }

    #[tokio::test]
    async fn test_response_serializes_wire_shape() {
        let (gate, _clock) = gate(5, 60_000);
        let resp = gate.request("k", None, || async { Ok(3) }).await;
        let json = serde_json::to_value(&resp).unwrap();

        assert_eq!(json["status"], "success");
        assert_eq!(json["rateLimit"]["limit"], 5);
        assert!(json.get("reset").is_none());
        assert!(json["rateLimit"].get("reset").is_some());
        assert!(json.get("error").is_none());
        assert!(json.get("correlationId").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_step_does_not_affect_window_or_ttl() {
        let (gate, clock) = gate(1, 1_000);
        let start = clock.now();

        let first = gate.request("k", None, || async { Ok(1) }).await;
        assert_eq!(first.timestamp, start);

        // Reported timestamps follow the wall clock; expiry does not.
        clock.set(start - chrono::Duration::minutes(10));
        tokio::time::advance(Duration::from_secs(5)).await;
        let refetched = gate.request("k", None, || async { Ok(2) }).await;
        assert!(!refetched.cached);
        assert_eq!(refetched.data, Some(2));
        assert_eq!(refetched.timestamp, start - chrono::Duration::minutes(10));

        clock.set(start + chrono::Duration::hours(1));
        let limited = gate.request("other", None, || async { Ok(3) }).await;
        assert_eq!(limited.status, ApiStatus::RateLimited);
    }
}
