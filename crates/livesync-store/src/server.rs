//! HTTP and WebSocket feed for the presentation layer.
//!
//! Routes:
//! - `GET  /api/snapshot`                 current `StoreState`
//! - `GET  /api/stats`                    store counters
//! - `GET  /api/connections`              push status plus per-account registry view
//! - `GET  /api/alerts`                   alert list
//! - `POST /api/alerts/{id}/dismiss`      remove one alert
//! - `POST /api/accounts/{id}/reconnect`  resume an exhausted account
//! - `GET  /metrics`                      Prometheus text
//! - `GET  /ws`                           snapshot on connect, then coalesced updates

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use livesync_alerts::{Alert, AlertDeriver};
use livesync_core::ConnectionState;
use livesync_registry::{ConnectionRegistry, ConnectionStatus};
use livesync_telemetry::Metrics;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::broadcast::attach_broadcaster;
use crate::config::ServerConfig;
use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::types::{FeedMessage, StoreState, StoreStats};

/// Caps concurrent WebSocket clients.
pub struct ConnectionLimiter {
    current: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    /// Take a slot, released when the guard drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current >= self.max {
                return None;
            }
            if self
                .current
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ConnectionGuard {
                    limiter: Arc::clone(self),
                });
            }
        }
    }

    pub fn current_count(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::Release);
    }
}

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct ServerState {
    store: Store,
    registry: Option<Arc<ConnectionRegistry>>,
    alerts: Option<Arc<AlertDeriver>>,
    broadcast_tx: broadcast::Sender<String>,
    connection_limiter: Arc<ConnectionLimiter>,
    config: ServerConfig,
}

impl ServerState {
    pub fn new(store: Store, config: ServerConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            store,
            registry: None,
            alerts: None,
            broadcast_tx,
            connection_limiter: Arc::new(ConnectionLimiter::new(config.max_connections)),
            config,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertDeriver>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn broadcast_sender(&self) -> broadcast::Sender<String> {
        self.broadcast_tx.clone()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsResponse {
    push: ConnectionState,
    accounts: Vec<ConnectionStatus>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: what })).into_response()
}

/// Create the axum router.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/stats", get(get_stats))
        .route("/api/connections", get(get_connections))
        .route("/api/alerts", get(get_alerts))
        .route("/api/alerts/{id}/dismiss", post(dismiss_alert))
        .route("/api/accounts/{id}/reconnect", post(reconnect_account))
        .route("/metrics", get(get_metrics))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_snapshot(State(state): State<ServerState>) -> Json<StoreState> {
    Json(state.store.snapshot())
}

async fn get_stats(State(state): State<ServerState>) -> Json<StoreStats> {
    Json(state.store.stats())
}

async fn get_connections(State(state): State<ServerState>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        push: state.store.snapshot().connection_status,
        accounts: state
            .registry
            .as_ref()
            .map(|r| r.get_connection_status())
            .unwrap_or_default(),
    })
}

async fn get_alerts(State(state): State<ServerState>) -> Json<Vec<Alert>> {
    Json(state.alerts.as_ref().map(|a| a.alerts()).unwrap_or_default())
}

async fn dismiss_alert(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    let Some(alerts) = state.alerts.as_ref() else {
        return not_found(format!("alert {id} not found"));
    };
    if !alerts.dismiss(&id) {
        return not_found(format!("alert {id} not found"));
    }
    state.store.set_alerts(alerts.alerts());
    StatusCode::NO_CONTENT.into_response()
}

async fn reconnect_account(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    match state.registry.as_ref() {
        Some(registry) if registry.reconnect_account(&id) => StatusCode::ACCEPTED.into_response(),
        _ => not_found(format!("account {id} not found")),
    }
}

async fn get_metrics() -> String {
    Metrics::render()
}

/// WebSocket upgrade handler.
async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    let Some(guard) = state.connection_limiter.try_acquire() else {
        warn!(
            current = state.connection_limiter.current_count(),
            max = state.config.max_connections,
            "WebSocket connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    info!(
        connections = state.connection_limiter.current_count(),
        "New feed connection"
    );
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, guard))
}

async fn handle_ws_connection(socket: WebSocket, state: ServerState, _guard: ConnectionGuard) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    let initial = FeedMessage::Snapshot(state.store.snapshot());
    if let Ok(json) = serde_json::to_string(&initial) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            debug!("Failed to send initial snapshot, client disconnected");
            return;
        }
    }

    let mut incoming_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    debug!("Client sent close frame");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Feed receive error");
                    break;
                }
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            result = broadcast_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            debug!("Failed to send update, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Feed client lagged, catching up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }
            _ = &mut incoming_task => {
                debug!("Incoming task completed, closing connection");
                break;
            }
        }
    }

    incoming_task.abort();
    info!(
        connections = state.connection_limiter.current_count().saturating_sub(1),
        "Feed connection closed"
    );
}

/// Serve the feed until `shutdown` fires.
pub async fn run_server(state: ServerState, shutdown: CancellationToken) -> StoreResult<()> {
    let feed = attach_broadcaster(&state.store, state.broadcast_sender());
    let port = state.config.port;
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(StoreError::Bind)?;
    info!(port, "Starting feed server");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(StoreError::Serve);

    feed.unsubscribe();
    info!("Feed server stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use livesync_alerts::default_rules;
    use livesync_core::{AccountSnapshot, SystemClock};
    use livesync_registry::RegistryConfig;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    fn server_state() -> (ServerState, Arc<ConnectionRegistry>, Arc<AlertDeriver>) {
        let store = Store::new(Arc::new(ManualScheduler::new()));
        let registry = Arc::new(ConnectionRegistry::new(
            ["acc-1"],
            RegistryConfig::default(),
            SystemClock::shared(),
        ));
        let alerts = Arc::new(AlertDeriver::new(default_rules(), SystemClock::shared()).unwrap());
        let state = ServerState::new(store, ServerConfig::default())
            .with_registry(registry.clone())
            .with_alerts(alerts.clone());
        (state, registry, alerts)
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_snapshot_endpoint() {
        let (state, _, _) = server_state();
        let (status, json) = call(create_router(state), "GET", "/api/snapshot").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connectionStatus"], "disconnected");
    }

    #[tokio::test]
    async fn test_connections_endpoint() {
        let (state, registry, _) = server_state();
        registry.mark_connected("acc-1").unwrap();

        let (status, json) = call(create_router(state), "GET", "/api/connections").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["push"], "disconnected");
        assert_eq!(json["accounts"][0]["entityId"], "acc-1");
        assert_eq!(json["accounts"][0]["status"], "connected");
    }

    #[tokio::test]
    async fn test_dismiss_alert_endpoint() {
        let (state, _, alerts) = server_state();
        let mut account = AccountSnapshot::new("acc-1");
        account.margin = dec!(1000);
        account.free_margin = dec!(100);
        account.margin_level = dec!(250);
        alerts.evaluate(&account);

        let router = create_router(state.clone());
        let (status, json) = call(router.clone(), "GET", "/api/alerts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["id"], "acc-1:margin_watch");

        let (status, _) = call(router.clone(), "POST", "/api/alerts/acc-1:margin_watch/dismiss").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(alerts.is_empty());

        let (status, json) = call(router, "POST", "/api/alerts/acc-1:margin_watch/dismiss").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_reconnect_endpoint() {
        let (state, registry, _) = server_state();
        let router = create_router(state);

        let (status, _) = call(router.clone(), "POST", "/api/accounts/acc-1/reconnect").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            registry.status("acc-1").unwrap().status,
            ConnectionState::Connecting
        );

        let (status, _) = call(router, "POST", "/api/accounts/nope/reconnect").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_connection_limiter() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        let guard = limiter.try_acquire();
        assert!(guard.is_some());
        assert!(limiter.try_acquire().is_none());
        drop(guard);
        assert_eq!(limiter.current_count(), 0);
        assert!(limiter.try_acquire().is_some());
    }
}
