//! Push connection manager.
//!
//! Keeps one WebSocket connection alive, retrying drops up to the configured
//! attempt count with a fixed interval or the shared backoff policy. While
//! the connection is down a fallback poller keeps data minimally fresh.

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use livesync_core::{BackoffPolicy, ConnectionQuality, ConnectionState, Message, MessageKind};
use livesync_telemetry::Metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message as Frame};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pull source used while the push connection is down.
pub type FallbackSource = Arc<dyn Fn() -> BoxFuture<'static, Vec<Message>> + Send + Sync>;

/// Push connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// WebSocket URL.
    #[serde(default)]
    pub url: String,
    /// Retries after a drop before giving up (0 = unlimited).
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Fixed retry delay, used when `backoff` is absent.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Exponential backoff instead of the fixed interval.
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    /// Silence after which a PING is sent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Time allowed for the PONG.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Fallback poll period while disconnected.
    #[serde(default = "default_fallback_poll_interval_ms")]
    pub fallback_poll_interval_ms: u64,
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_interval_ms() -> u64 {
    3_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_poll_interval_ms() -> u64 {
    5_000
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            backoff: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            fallback_poll_interval_ms: default_fallback_poll_interval_ms(),
        }
    }
}

impl IngressConfig {
    /// Delay before retry number `retry` (0-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        match &self.backoff {
            Some(policy) => policy.delay(retry),
            None => Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

/// Push connection with reconnect, heartbeat and fallback polling.
pub struct StreamIngress {
    config: IngressConfig,
    status_tx: watch::Sender<ConnectionState>,
    heartbeat: HeartbeatManager,
    message_tx: mpsc::Sender<Message>,
    fallback: Option<FallbackSource>,
    fallback_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_count: AtomicU32,
    shutdown_token: CancellationToken,
}

impl StreamIngress {
    pub fn new(config: IngressConfig, message_tx: mpsc::Sender<Message>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            heartbeat: HeartbeatManager::new(config.heartbeat_interval_ms, config.heartbeat_timeout_ms),
            config,
            status_tx,
            message_tx,
            fallback: None,
            fallback_task: Mutex::new(None),
            reconnect_count: AtomicU32::new(0),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Attach a pull source polled while the connection is down.
    pub fn with_fallback(mut self, source: FallbackSource) -> Self {
        self.fallback = Some(source);
        self
    }

    pub fn status(&self) -> ConnectionState {
        *self.status_tx.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Quality tier from status, heartbeat round trip and inbound silence.
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::assess(
            self.status(),
            self.heartbeat.last_rtt_ms(),
            Some(self.heartbeat.time_since_last_message().as_millis() as i64),
        )
    }

    /// Stop the connection, any pending retry, and the fallback poller.
    pub fn disconnect(&self) {
        info!("StreamIngress disconnect requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Connect and run until `disconnect()` or until retries are exhausted.
    ///
    /// Exhaustion leaves the status at `Error`; the fallback poller keeps
    /// running until `disconnect()`.
    pub async fn connect(&self) -> WsResult<()> {
        self.start_fallback();
        self.connect_with_retry().await
    }

    async fn connect_with_retry(&self) -> WsResult<()> {
        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting connect loop");
                self.set_status(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_status(ConnectionState::Connecting);

            match self.try_connect().await {
                Ok(()) => info!("Push connection closed"),
                Err(e) => warn!(error = %e, "Push connection error"),
            }
            Metrics::set_ingress_connected(false);

            if self.is_shutdown() {
                info!("Shutdown requested after disconnect, not reconnecting");
                self.set_status(ConnectionState::Disconnected);
                return Ok(());
            }

            let attempt = self.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1;
            let max = self.config.reconnect_attempts;
            if max > 0 && attempt > max {
                error!(attempts = max, "Max reconnection attempts reached");
                self.set_status(ConnectionState::Error);
                return Err(WsError::ReconnectExhausted { attempts: max });
            }

            self.set_status(ConnectionState::Disconnected);
            Metrics::ingress_reconnect();

            let delay = self.config.retry_delay(attempt - 1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.set_status(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    async fn try_connect(&self) -> WsResult<()> {
        info!(url = %self.config.url, "Connecting push transport");

        let (ws_stream, _response) = tokio::select! {
            result = connect_async_tls_with_config(&self.config.url, None, true, None) => result?,
            () = self.shutdown_token.cancelled() => return Ok(()),
        };
        let (mut write, mut read) = ws_stream.split();

        self.reconnect_count.store(0, Ordering::Relaxed);
        self.heartbeat.reset();
        self.set_status(ConnectionState::Connected);
        Metrics::set_ingress_connected(true);
        info!("Push transport connected");

        let mut heartbeat_check = tokio::time::interval(self.heartbeat.check_period());
        heartbeat_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    if let Err(e) = write.send(Frame::Close(None)).await {
                        warn!(error = %e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            if let Some(reply) = self.handle_text_message(&text).await {
                                write.send(Frame::Text(reply)).await?;
                            }
                        }
                        Some(Ok(Frame::Ping(data))) => {
                            self.heartbeat.record_message();
                            write.send(Frame::Pong(data)).await?;
                        }
                        Some(Ok(Frame::Pong(_))) => {
                            self.heartbeat.record_message();
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Frame::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "Push connection closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Push connection read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("Push stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = heartbeat_check.tick() => {
                    if self.heartbeat.is_timed_out() {
                        error!("Heartbeat timeout");
                        return Err(WsError::HeartbeatTimeout);
                    }

                    if self.heartbeat.should_send_heartbeat() {
                        let ping = Message::ping().to_json()?;
                        write
                            .send(Frame::Text(ping))
                            .await
                            .map_err(|e| WsError::SendFailed(e.to_string()))?;
                        self.heartbeat.record_ping();
                        debug!("Sent heartbeat ping");
                    }
                }
            }
        }
    }

    /// Decode and forward one text frame. Returns a reply frame, if any.
    ///
    /// Malformed envelopes are dropped with a warning.
    async fn handle_text_message(&self, text: &str) -> Option<String> {
        self.heartbeat.record_message();

        let msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropping malformed push frame");
                Metrics::message_dropped("malformed");
                return None;
            }
        };

        match msg.kind {
            MessageKind::Pong => {
                self.heartbeat.record_pong();
                return None;
            }
            MessageKind::Ping => {
                let pong = Message::new(MessageKind::Pong, serde_json::Value::Null)
                    .with_correlation_id(msg.correlation_id);
                return pong.to_json().ok();
            }
            MessageKind::Heartbeat => {
                debug!("Server heartbeat");
                return None;
            }
            _ => {}
        }

        if self.message_tx.send(msg).await.is_err() {
            warn!("Message receiver dropped");
        }
        None
    }

    fn set_status(&self, status: ConnectionState) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(%status, "Push status changed");
        }
    }

    fn start_fallback(&self) {
        let Some(source) = self.fallback.clone() else {
            return;
        };
        let mut task = self.fallback_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        *task = Some(tokio::spawn(run_fallback(
            source,
            Duration::from_millis(self.config.fallback_poll_interval_ms),
            self.status_tx.subscribe(),
            self.message_tx.clone(),
            self.shutdown_token.clone(),
        )));
    }
}

/// Poll `source` every `period` from the moment the connection goes down
/// (disconnected or error) until it is connected again.
async fn run_fallback(
    source: FallbackSource,
    period: Duration,
    mut status_rx: watch::Receiver<ConnectionState>,
    message_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    loop {
        // Wait for the connection to go down.
        loop {
            if status_rx.borrow_and_update().is_down() {
                break;
            }
            tokio::select! {
                () = shutdown.cancelled() => return,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        info!(period_ms = period.as_millis() as u64, "Fallback polling active");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Fallback poller stopped");
                    return;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if status_rx.borrow_and_update().is_connected() {
                        info!("Push restored, fallback polling disabled");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let messages = source().await;
                    debug!(count = messages.len(), "Fallback poll");
                    for msg in messages {
                        if message_tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
