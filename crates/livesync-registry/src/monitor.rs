//! Per-account pull loop.
//!
//! One task per configured entity. Each cycle fetches account information
//! and positions through the shared `RateLimitedCache`, reports the outcome
//! to the `ConnectionRegistry`, and emits `MonitorEvent`s for the store.

use crate::client::AccountSource;
use crate::connection::{ConnectionRegistry, ConnectionStatus, ReconnectDecision};
use crate::rate_limited_cache::{ApiResponse, ApiStatus, RateLimitedCache};
use livesync_core::{AccountSnapshot, PositionSnapshot};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for waits on a rate-limited window.
const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between successful polls.
    pub poll_interval: Duration,
    /// Cache TTL for account information (None = cache default).
    pub account_ttl: Option<Duration>,
    /// Cache TTL for positions (None = cache default).
    pub positions_ttl: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            account_ttl: None,
            positions_ttl: None,
        }
    }
}

/// Output of the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Fresh snapshot with derived account status.
    Snapshot {
        account: AccountSnapshot,
        positions: Vec<PositionSnapshot>,
        correlation_id: String,
    },
    /// Connection state of one entity changed.
    Status(ConnectionStatus),
}

/// Spawns and owns the per-entity tasks.
pub struct AccountMonitor<S: AccountSource> {
    source: Arc<S>,
    gate: Arc<RateLimitedCache<Value>>,
    registry: Arc<ConnectionRegistry>,
    config: MonitorConfig,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: AccountSource> AccountMonitor<S> {
    pub fn new(
        source: Arc<S>,
        gate: Arc<RateLimitedCache<Value>>,
        registry: Arc<ConnectionRegistry>,
        config: MonitorConfig,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            source,
            gate,
            registry,
            config,
            events,
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one task per registered entity. No-op while already running.
    pub fn start(&self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            debug!("Account monitor already running");
            return;
        }
        let token = CancellationToken::new();

        let mut tasks = self.tasks.lock();
        for account_id in self.registry.entity_ids() {
            let Some(wakeup) = self.registry.reconnect_signal(&account_id) else {
                continue;
            };
            let worker = EntityWorker {
                account_id,
                source: Arc::clone(&self.source),
                gate: Arc::clone(&self.gate),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
                events: self.events.clone(),
                shutdown: token.clone(),
                wakeup,
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        info!(entities = tasks.len(), "Account monitor started");
        *shutdown = Some(token);
    }

    /// Cancel every task and wait for them to finish.
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Account monitor task ended abnormally");
            }
        }
        info!("Account monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

enum PollOutcome {
    Snapshot(AccountSnapshot, Vec<PositionSnapshot>, String),
    RateLimited(Duration),
    Failed(String),
}

struct EntityWorker<S> {
    account_id: String,
    source: Arc<S>,
    gate: Arc<RateLimitedCache<Value>>,
    registry: Arc<ConnectionRegistry>,
    config: MonitorConfig,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
    wakeup: Arc<Notify>,
}

impl<S: AccountSource> EntityWorker<S> {
    async fn run(self) {
        debug!(account_id = %self.account_id, "Entity worker started");
        let mut last_published = None;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.registry.mark_connecting(&self.account_id).is_err() {
                break;
            }
            self.publish_status(&mut last_published).await;

            let wait = match self.poll_once().await {
                PollOutcome::Snapshot(account, positions, correlation_id) => {
                    let _ = self.registry.mark_connected(&self.account_id);
                    self.publish_status(&mut last_published).await;
                    self.emit(MonitorEvent::Snapshot {
                        account,
                        positions,
                        correlation_id,
                    })
                    .await;
                    self.config.poll_interval
                }
                PollOutcome::RateLimited(reset) => {
                    debug!(account_id = %self.account_id, reset_ms = reset.as_millis() as u64, "Waiting for rate window");
                    reset.max(MIN_RATE_LIMIT_WAIT)
                }
                PollOutcome::Failed(error) => {
                    let decision = self.registry.mark_error(&self.account_id, error);
                    self.publish_status(&mut last_published).await;
                    match decision {
                        Ok(ReconnectDecision::Retry(delay)) => delay,
                        Ok(ReconnectDecision::Exhausted) => {
                            if !self.park().await {
                                break;
                            }
                            continue;
                        }
                        Err(_) => break,
                    }
                }
            };

            if !self.wait(wait).await {
                break;
            }
        }

        debug!(account_id = %self.account_id, "Entity worker stopped");
    }

    async fn poll_once(&self) -> PollOutcome {
        let id = self.account_id.as_str();

        let account = self
            .gate
            .request(&format!("account:{id}"), self.config.account_ttl, || {
                self.source.fetch_account_information(id)
            })
            .await;
        let correlation_id = account.correlation_id.clone();
        let account = match self.unpack(account) {
            Ok(value) => value,
            Err(outcome) => return outcome,
        };

        let positions = self
            .gate
            .request(&format!("positions:{id}"), self.config.positions_ttl, || {
                self.source.fetch_positions(id)
            })
            .await;
        let positions = match self.unpack(positions) {
            Ok(value) => value,
            Err(outcome) => return outcome,
        };

        match (decode_account(id, account), decode_positions(id, positions)) {
            (Ok(account), Ok(positions)) => PollOutcome::Snapshot(account, positions, correlation_id),
            (Err(e), _) | (_, Err(e)) => PollOutcome::Failed(e),
        }
    }

    /// Record limiter state and split a response into payload or outcome.
    fn unpack(&self, response: ApiResponse<Value>) -> Result<Value, PollOutcome> {
        let _ = self.registry.update_rate_limit(
            &self.account_id,
            response.is_rate_limited(),
            response.rate_limit.remaining,
        );

        match response.status {
            ApiStatus::Success => response
                .data
                .ok_or_else(|| PollOutcome::Failed("empty response".to_string())),
            ApiStatus::RateLimited => Err(PollOutcome::RateLimited(response.rate_limit.reset_in())),
            ApiStatus::Error => Err(PollOutcome::Failed(
                response.error.unwrap_or_else(|| "upstream error".to_string()),
            )),
        }
    }

    /// Publish the registry entry if its state changed since last time.
    async fn publish_status(&self, last: &mut Option<livesync_core::ConnectionState>) {
        let Some(status) = self.registry.status(&self.account_id) else {
            return;
        };
        if *last == Some(status.status) {
            return;
        }
        *last = Some(status.status);
        self.emit(MonitorEvent::Status(status)).await;
    }

    async fn emit(&self, event: MonitorEvent) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    debug!(account_id = %self.account_id, "Monitor event receiver dropped");
                }
            }
        }
    }

    /// Sleep, returning early on a reconnect request. False on shutdown.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = self.wakeup.notified() => true,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Block until `reconnect_account`. False on shutdown.
    async fn park(&self) -> bool {
        info!(account_id = %self.account_id, "Auto-reconnect stopped, waiting for manual reconnect");
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = self.wakeup.notified() => true,
        }
    }
}

/// Decode an account payload, filling in the id when the upstream omits it.
pub fn decode_account(account_id: &str, mut value: Value) -> Result<AccountSnapshot, String> {
    if let Value::Object(map) = &mut value {
        if !["account_id", "accountId", "id"].iter().any(|k| map.contains_key(*k)) {
            map.insert("account_id".to_string(), Value::String(account_id.to_string()));
        }
    }
    serde_json::from_value::<AccountSnapshot>(value)
        .map(AccountSnapshot::with_derived_status)
        .map_err(|e| format!("invalid account payload: {e}"))
}

/// Decode a positions payload: a bare array or `{"positions": [...]}`.
pub fn decode_positions(account_id: &str, value: Value) -> Result<Vec<PositionSnapshot>, String> {
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map.remove("positions").unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => return Err(format!("invalid positions payload: {other}")),
    };

    let mut positions: Vec<PositionSnapshot> =
        serde_json::from_value(list).map_err(|e| format!("invalid positions payload: {e}"))?;
    for position in &mut positions {
        if position.account_id.is_empty() {
            position.account_id = account_id.to_string();
        }
    }
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RegistryConfig;
    use crate::error::UpstreamError;
    use crate::rate_limited_cache::RateLimitedCacheConfig;
    use livesync_core::{AccountStatus, BackoffPolicy, ConnectionState, SystemClock};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockSource {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    impl MockSource {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl AccountSource for MockSource {
        async fn fetch_account_information(&self, account_id: &str) -> Result<Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(UpstreamError::Transport("connection refused".to_string()));
            }
            Ok(json!({
                "accountId": account_id,
                "balance": "10000",
                "equity": "9500",
                "margin": "1000",
                "freeMargin": "8500",
                "marginLevel": "150"
            }))
        }

        async fn fetch_positions(&self, _account_id: &str) -> Result<Value, UpstreamError> {
            Ok(json!({"positions": [
                {"id": "p-1", "symbol": "EURUSD", "type": "POSITION_TYPE_BUY", "volume": "0.1", "openPrice": "1.1"}
            ]}))
        }
    }

    fn monitor(
        source: MockSource,
        retry_attempts: u32,
    ) -> (AccountMonitor<MockSource>, mpsc::Receiver<MonitorEvent>) {
        let clock = SystemClock::shared();
        let gate = Arc::new(RateLimitedCache::new(
            RateLimitedCacheConfig {
                default_ttl: Duration::from_millis(1),
                ..Default::default()
            },
            clock.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            ["acc-1"],
            RegistryConfig {
                retry_attempts,
                backoff: BackoffPolicy::exponential(10, 50),
            },
            clock,
        ));
        let (tx, rx) = mpsc::channel(64);
        let config = MonitorConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        (AccountMonitor::new(Arc::new(source), gate, registry, config, tx), rx)
    }

    async fn next_snapshot(rx: &mut mpsc::Receiver<MonitorEvent>) -> (AccountSnapshot, Vec<PositionSnapshot>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for snapshot")
                .expect("channel closed");
            if let MonitorEvent::Snapshot { account, positions, .. } = event {
                return (account, positions);
            }
        }
    }

    #[tokio::test]
    async fn test_poll_emits_snapshot_with_derived_status() {
        let (monitor, mut rx) = monitor(MockSource::new(false), 3);
        monitor.start();

        let (account, positions) = next_snapshot(&mut rx).await;
        assert_eq!(account.account_id, "acc-1");
        assert_eq!(account.status, AccountStatus::Warning);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].account_id, "acc-1");

        let status = monitor.registry().status("acc-1").unwrap();
        assert_eq!(status.retry_count, 0);
        assert!(status.last_successful_connection.is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_exhausted_entity_resumes_after_manual_reconnect() {
        let (monitor, mut rx) = monitor(MockSource::new(true), 1);
        monitor.start();

        // Two failures: one retry, then exhaustion.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = monitor.registry().status("acc-1").unwrap();
            if !status.auto_reconnect {
                assert_eq!(status.status, ConnectionState::Error);
                assert_eq!(status.retry_count, 2);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "never exhausted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let calls_when_parked = monitor.source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.source.calls.load(Ordering::SeqCst), calls_when_parked);

        monitor.source.failing.store(false, Ordering::SeqCst);
        assert!(monitor.registry().reconnect_account("acc-1"));

        let (account, _) = next_snapshot(&mut rx).await;
        assert_eq!(account.account_id, "acc-1");
        monitor.stop().await;
    }

    #[test]
    fn test_decode_account_fills_missing_id() {
        let account = decode_account("acc-9", json!({"balance": 100, "margin": 0})).unwrap();
        assert_eq!(account.account_id, "acc-9");
        assert_eq!(account.status, AccountStatus::Healthy);
    }

    #[test]
    fn test_decode_positions_shapes() {
        assert!(decode_positions("a", Value::Null).unwrap().is_empty());
        assert!(decode_positions("a", json!([])).unwrap().is_empty());
        assert!(decode_positions("a", json!("nope")).is_err());
    }
}
