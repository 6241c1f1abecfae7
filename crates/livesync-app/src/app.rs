//! Main application orchestration.
//!
//! Wires the pipeline together:
//! - StreamIngress -> message pump -> Store
//! - StreamIngress status -> Store connection status
//! - AccountMonitor -> event pump -> Store (as ACCOUNT_UPDATE / POSITION_UPDATE)
//! - ACCOUNT_UPDATE handler -> AlertDeriver -> Store alerts
//! - cache sweeper, optional feed server

use crate::config::AppConfig;
use crate::error::AppResult;
use futures_util::FutureExt;
use livesync_alerts::AlertDeriver;
use livesync_core::{
    AccountSnapshot, ConnectionState, Message, MessageKind, PositionSnapshot, SharedClock,
    SystemClock,
};
use livesync_registry::{
    decode_account, decode_positions, AccountApi, AccountMonitor, AccountSource,
    ConnectionRegistry, MonitorEvent, RateLimitedCache,
};
use livesync_store::{run_server, ServerState, Store, Subscription, TokioScheduler};
use livesync_ws::{FallbackSource, StreamIngress};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered push messages between ingress and store.
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

/// Buffered monitor events.
const MONITOR_CHANNEL_CAPACITY: usize = 256;

/// Main application.
pub struct Application<S: AccountSource = AccountApi> {
    config: AppConfig,
    store: Store,
    ingress: Option<Arc<StreamIngress>>,
    message_rx: Option<mpsc::Receiver<Message>>,
    gate: Arc<RateLimitedCache<Value>>,
    registry: Arc<ConnectionRegistry>,
    monitor: Arc<AccountMonitor<S>>,
    monitor_rx: Option<mpsc::Receiver<MonitorEvent>>,
    alerts: Arc<AlertDeriver>,
    alert_subscription: Option<Subscription>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Application<AccountApi> {
    /// Create the application against the configured HTTP API.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let api = AccountApi::with_timeout(&config.api.base_url, config.api.request_timeout())?;
        Self::with_source(config, Arc::new(api), SystemClock::shared())
    }
}

impl<S: AccountSource> Application<S> {
    /// Create the application with an explicit account source and clock.
    pub fn with_source(config: AppConfig, source: Arc<S>, clock: SharedClock) -> AppResult<Self> {
        config.validate()?;

        let store = Store::new(Arc::new(TokioScheduler::new(config.store.coalesce_window())));
        let gate = Arc::new(RateLimitedCache::new(config.api.cache_config(), clock.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            config.accounts.iter().cloned(),
            config.api.registry_config(),
            clock.clone(),
        ));
        let alerts = Arc::new(AlertDeriver::new(config.alerts.rules(), clock)?);

        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CHANNEL_CAPACITY);
        let monitor = Arc::new(AccountMonitor::new(
            Arc::clone(&source),
            Arc::clone(&gate),
            Arc::clone(&registry),
            config.api.monitor_config(),
            monitor_tx,
        ));

        let (ingress, message_rx) = if config.has_stream() {
            let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
            let mut ingress = StreamIngress::new(config.stream.clone(), message_tx);
            if !config.accounts.is_empty() {
                ingress = ingress.with_fallback(fallback_source(
                    Arc::clone(&source),
                    Arc::clone(&gate),
                    store.clone(),
                    config.accounts.clone(),
                ));
            }
            (Some(Arc::new(ingress)), Some(message_rx))
        } else {
            info!("No stream url configured, running pull-only");
            (None, None)
        };

        Ok(Self {
            config,
            store,
            ingress,
            message_rx,
            gate,
            registry,
            monitor,
            monitor_rx: Some(monitor_rx),
            alerts,
            alert_subscription: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawn every pipeline task. Calling it twice is a no-op.
    pub fn start(&mut self) -> AppResult<()> {
        if self.is_running() {
            debug!("Application already started");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            warn!("Application was stopped and cannot be restarted");
            return Ok(());
        }
        info!(
            accounts = self.config.accounts.len(),
            stream = self.config.has_stream(),
            server = self.config.server.enabled,
            "Starting application"
        );

        self.alert_subscription = Some(self.attach_alerts());

        if let Some(ingress) = &self.ingress {
            let connector = Arc::clone(ingress);
            self.tasks.push(tokio::spawn(async move {
                match connector.connect().await {
                    Ok(()) => info!("Stream ingress stopped"),
                    Err(e) => error!(error = %e, "Stream ingress gave up"),
                }
            }));
            self.tasks.push(self.spawn_status_pump(Arc::clone(ingress)));
        }

        if let Some(rx) = self.message_rx.take() {
            self.tasks.push(self.spawn_message_pump(rx));
        }

        if let Some(rx) = self.monitor_rx.take() {
            self.tasks.push(self.spawn_monitor_pump(rx));
        }
        self.monitor.start();

        let sweep_interval = Duration::from_millis(self.config.api.cache.sweep_interval_ms.max(1));
        self.tasks
            .push(self.gate.spawn_sweeper(sweep_interval, self.shutdown.child_token()));

        if self.config.server.enabled {
            let state = ServerState::new(self.store.clone(), self.config.server.clone())
                .with_registry(Arc::clone(&self.registry))
                .with_alerts(Arc::clone(&self.alerts));
            let token = self.shutdown.child_token();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = run_server(state, token).await {
                    error!(error = %e, "Feed server failed");
                }
            }));
        }

        info!("Application started");
        Ok(())
    }

    /// Cancel every task and wait for it to finish. Store state stays readable.
    pub async fn stop(&mut self) {
        info!("Stopping application");
        self.shutdown.cancel();
        if let Some(ingress) = &self.ingress {
            ingress.disconnect();
        }
        self.monitor.stop().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Application task ended abnormally");
            }
        }

        if let Some(subscription) = self.alert_subscription.take() {
            subscription.unsubscribe();
        }
        info!("Application stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.shutdown.is_cancelled()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn alerts(&self) -> &Arc<AlertDeriver> {
        &self.alerts
    }

    /// Push transport status (`Disconnected` when pull-only).
    pub fn stream_status(&self) -> ConnectionState {
        self.ingress
            .as_ref()
            .map(|i| i.status())
            .unwrap_or_default()
    }

    /// Evaluate alert rules on every account update, pushed or pulled.
    fn attach_alerts(&self) -> Subscription {
        let alerts = Arc::clone(&self.alerts);
        let store = self.store.clone();
        self.store.on_message(MessageKind::AccountUpdate, move |msg| {
            let account = match msg.decode_data::<AccountSnapshot>() {
                Ok(account) => account.with_derived_status(),
                Err(e) => {
                    debug!(error = %e, "Skipping alert evaluation");
                    return;
                }
            };
            let fired = alerts.evaluate(&account);
            if !fired.is_empty() {
                debug!(
                    account_id = %account.account_id,
                    fired = fired.len(),
                    "Alert rules triggered"
                );
            }
            store.set_alerts(alerts.alerts());
        })
    }

    fn spawn_message_pump(&self, mut rx: mpsc::Receiver<Message>) -> JoinHandle<()> {
        let store = self.store.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => store.process_message(&msg),
                        None => break,
                    },
                }
            }
            debug!("Message pump stopped");
        })
    }

    fn spawn_status_pump(&self, ingress: Arc<StreamIngress>) -> JoinHandle<()> {
        let store = self.store.clone();
        let shutdown = self.shutdown.child_token();
        let mut status_rx = ingress.subscribe_status();
        tokio::spawn(async move {
            let initial = *status_rx.borrow_and_update();
            store.set_connection_status(initial);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *status_rx.borrow_and_update();
                        store.set_connection_status(status);
                    }
                }
            }
            debug!("Status pump stopped");
        })
    }

    fn spawn_monitor_pump(&self, mut rx: mpsc::Receiver<MonitorEvent>) -> JoinHandle<()> {
        let store = self.store.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut open_positions: HashMap<String, Vec<PositionSnapshot>> = HashMap::new();
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    MonitorEvent::Snapshot {
                        account,
                        positions,
                        correlation_id,
                    } => {
                        let previous = open_positions
                            .insert(account.account_id.clone(), positions.clone())
                            .unwrap_or_default();
                        for msg in snapshot_messages(&account, &positions, &previous, &correlation_id) {
                            store.process_message(&msg);
                        }
                    }
                    MonitorEvent::Status(status) => store.update_entity_connection(status),
                }
            }
            debug!("Monitor pump stopped");
        })
    }
}

/// Turn one pulled snapshot into store messages.
///
/// Positions present in `previous` but missing now are closed with a
/// zero-volume update.
fn snapshot_messages(
    account: &AccountSnapshot,
    positions: &[PositionSnapshot],
    previous: &[PositionSnapshot],
    correlation_id: &str,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(1 + positions.len());
    if let Some(msg) = to_message(MessageKind::AccountUpdate, account, correlation_id) {
        messages.push(msg);
    }

    for position in positions {
        if let Some(msg) = to_message(MessageKind::PositionUpdate, position, correlation_id) {
            messages.push(msg);
        }
    }

    let current: HashSet<&str> = positions.iter().map(|p| p.position_id.as_str()).collect();
    for closed in previous
        .iter()
        .filter(|p| !current.contains(p.position_id.as_str()))
    {
        let mut closed = closed.clone();
        closed.volume = Default::default();
        if let Some(msg) = to_message(MessageKind::PositionUpdate, &closed, correlation_id) {
            messages.push(msg);
        }
    }
    messages
}

fn to_message<T: serde::Serialize>(kind: MessageKind, data: &T, correlation_id: &str) -> Option<Message> {
    match serde_json::to_value(data) {
        Ok(value) => Some(Message::new(kind, value).with_correlation_id(correlation_id)),
        Err(e) => {
            warn!(error = %e, "Failed to encode snapshot");
            None
        }
    }
}

/// Pull-based stand-in for the push channel while it is down.
///
/// Goes through the shared gate, so it never exceeds the upstream rate
/// limit and reuses fresh cache entries of the monitor. Positions the store
/// still holds for an account but the pulled list lacks are closed.
fn fallback_source<S: AccountSource>(
    source: Arc<S>,
    gate: Arc<RateLimitedCache<Value>>,
    store: Store,
    account_ids: Vec<String>,
) -> FallbackSource {
    let account_ids = Arc::new(account_ids);
    Arc::new(move || {
        let source = Arc::clone(&source);
        let gate = Arc::clone(&gate);
        let store = store.clone();
        let account_ids = Arc::clone(&account_ids);
        async move {
            let mut messages = Vec::new();
            for id in account_ids.iter() {
                let response = gate
                    .request(&format!("account:{id}"), None, || {
                        source.fetch_account_information(id)
                    })
                    .await;
                let correlation_id = response.correlation_id;
                let Some(account) = response.data.and_then(|v| decode_account(id, v).ok()) else {
                    continue;
                };

                let positions = gate
                    .request(&format!("positions:{id}"), None, || source.fetch_positions(id))
                    .await
                    .data
                    .and_then(|v| decode_positions(id, v).ok());

                match positions {
                    Some(positions) => {
                        let previous = held_positions(&store, id);
                        messages.extend(snapshot_messages(
                            &account,
                            &positions,
                            &previous,
                            &correlation_id,
                        ));
                    }
                    // Unknown position list: update the account, close nothing.
                    None => messages.extend(snapshot_messages(&account, &[], &[], &correlation_id)),
                }
            }
            messages
        }
        .boxed()
    })
}

/// Open positions the store currently holds for `account_id`.
fn held_positions(store: &Store, account_id: &str) -> Vec<PositionSnapshot> {
    store
        .snapshot()
        .positions
        .into_values()
        .filter(|p| p.account_id == account_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use livesync_core::PositionSide;
    use livesync_registry::{RateLimitedCacheConfig, UpstreamError};
    use livesync_store::ManualScheduler;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Account "acc-1" holding only "p-1".
    struct OnePositionSource {
        positions_down: AtomicBool,
    }

    impl AccountSource for OnePositionSource {
        async fn fetch_account_information(&self, account_id: &str) -> Result<Value, UpstreamError> {
            Ok(json!({
                "accountId": account_id,
                "balance": "10000",
                "equity": "10000",
                "margin": "100",
                "freeMargin": "9900",
                "marginLevel": "10000"
            }))
        }

        async fn fetch_positions(&self, _account_id: &str) -> Result<Value, UpstreamError> {
            if self.positions_down.load(Ordering::SeqCst) {
                return Err(UpstreamError::Transport("connection refused".to_string()));
            }
            Ok(serde_json::to_value(vec![position("p-1")]).unwrap_or_default())
        }
    }

    fn store_holding(ids: &[&str]) -> Store {
        let store = Store::new(Arc::new(ManualScheduler::new()));
        for id in ids {
            let msg = to_message(MessageKind::PositionUpdate, &position(id), "seed").unwrap();
            store.process_message(&msg);
        }
        store.flush();
        store
    }

    fn fallback_for(store: &Store, positions_down: bool) -> FallbackSource {
        let source = Arc::new(OnePositionSource {
            positions_down: AtomicBool::new(positions_down),
        });
        let gate = Arc::new(RateLimitedCache::new(
            RateLimitedCacheConfig::default(),
            SystemClock::shared(),
        ));
        fallback_source(source, gate, store.clone(), vec!["acc-1".to_string()])
    }

    fn position(id: &str) -> PositionSnapshot {
        PositionSnapshot {
            position_id: id.to_string(),
            account_id: "acc-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume: dec!(0.1),
            open_price: dec!(1.1),
            current_price: None,
            profit: dec!(0),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_messages_close_missing_positions() {
        let account = AccountSnapshot::new("acc-1");
        let previous = vec![position("p-1"), position("p-2")];
        let current = vec![position("p-1")];

        let messages = snapshot_messages(&account, &current, &previous, "c-1");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind, MessageKind::AccountUpdate);
        assert!(messages.iter().all(|m| m.correlation_id == "c-1"));

        let closed: PositionSnapshot = messages[2].decode_data().unwrap();
        assert_eq!(closed.position_id, "p-2");
        assert!(closed.volume.is_zero());
    }

    #[tokio::test]
    async fn test_fallback_closes_positions_missing_upstream() {
        let store = store_holding(&["p-1", "p-2"]);
        let fallback = fallback_for(&store, false);

        let messages = fallback().await;
        let correlation_id = messages[0].correlation_id.clone();
        assert!(!correlation_id.is_empty());
        assert_ne!(correlation_id, "fallback");
        assert!(messages.iter().all(|m| m.correlation_id == correlation_id));

        for msg in &messages {
            store.process_message(msg);
        }
        store.flush();
        let state = store.snapshot();
        assert!(state.accounts.contains_key("acc-1"));
        assert_eq!(state.positions.keys().collect::<Vec<_>>(), vec!["p-1"]);

        let next = fallback().await;
        assert_ne!(next[0].correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn test_fallback_keeps_positions_when_list_unavailable() {
        let store = store_holding(&["p-1", "p-2"]);
        let fallback = fallback_for(&store, true);

        let messages = fallback().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::AccountUpdate);

        store.process_message(&messages[0]);
        store.flush();
        assert_eq!(store.snapshot().positions.len(), 2);
    }
}
