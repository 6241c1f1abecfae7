//! End-to-end pipeline tests.
//!
//! Push and pull data flow through the application into the store:
//! - Pushed prices and pulled accounts land in one state
//! - Account status and alerts are derived on ingestion
//! - Exhausted accounts resume on an explicit reconnect

mod integration;
use integration::common::mock_source::MockAccountSource;
use integration::common::mock_ws::MockWsServer;
use integration::common::wait_for;

use livesync_app::config::ApiConfig;
use livesync_app::{AppConfig, Application};
use livesync_core::{AccountStatus, ConnectionState, SystemClock};
use livesync_ws::IngressConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn app_config(stream_url: Option<String>) -> AppConfig {
    AppConfig {
        accounts: vec!["acc-1".to_string()],
        stream: IngressConfig {
            url: stream_url.unwrap_or_default(),
            reconnect_interval_ms: 100,
            ..Default::default()
        },
        api: ApiConfig {
            poll_interval_ms: 50,
            retry_delay_ms: 20,
            max_retry_delay_ms: 40,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_push_and_pull_reach_the_store() {
    let server = MockWsServer::start().await;
    let source = Arc::new(MockAccountSource::with_margin_level("150"));
    let mut app =
        Application::with_source(app_config(Some(server.url())), source, SystemClock::shared())
            .unwrap();
    app.start().unwrap();
    assert!(app.is_running());

    let store = app.store().clone();
    assert!(
        wait_for(Duration::from_secs(3), || {
            store.snapshot().connection_status == ConnectionState::Connected
        })
        .await,
        "Push status should reach the store"
    );

    server.push(
        json!({
            "type": "PRICE_UPDATE",
            "data": {"symbol": "EURUSD", "bid": "1.0850", "ask": "1.0852"}
        })
        .to_string(),
    );

    assert!(
        wait_for(Duration::from_secs(3), || {
            let state = store.snapshot();
            state.prices.contains_key("EURUSD")
                && state.accounts.contains_key("acc-1")
                && state.positions.contains_key("acc-1-p1")
        })
        .await,
        "Pushed price and pulled snapshot should both land"
    );

    let state = store.snapshot();
    assert_eq!(state.accounts["acc-1"].status, AccountStatus::Warning);
    assert_eq!(state.positions["acc-1-p1"].account_id, "acc-1");

    assert!(
        wait_for(Duration::from_secs(3), || {
            let state = store.snapshot();
            state
                .entity_connections
                .get("acc-1")
                .is_some_and(|s| s.status == ConnectionState::Connected)
                && state.alerts.iter().any(|a| a.id == "acc-1:low_margin")
        })
        .await,
        "Entity connection and alerts should be published"
    );
    assert!(!store
        .snapshot()
        .alerts
        .iter()
        .any(|a| a.id == "acc-1:margin_call"));

    app.stop().await;
    assert!(!app.is_running());
    assert!(store.snapshot().accounts.contains_key("acc-1"));
    server.shutdown().await;
}

#[tokio::test]
async fn test_pushed_account_update_raises_critical_alert() {
    let server = MockWsServer::start().await;
    let mut config = app_config(Some(server.url()));
    config.accounts.clear();

    let mut app = Application::with_source(
        config,
        Arc::new(MockAccountSource::healthy()),
        SystemClock::shared(),
    )
    .unwrap();
    app.start().unwrap();

    let store = app.store().clone();
    assert!(
        wait_for(Duration::from_secs(3), || {
            store.snapshot().connection_status == ConnectionState::Connected
        })
        .await
    );

    server.push(
        json!({
            "type": "ACCOUNT_UPDATE",
            "data": {
                "account_id": "acc-7",
                "balance": "1000",
                "equity": "400",
                "margin": "500",
                "free_margin": "0",
                "margin_level": "80",
                "status": "healthy"
            }
        })
        .to_string(),
    );

    assert!(
        wait_for(Duration::from_secs(3), || {
            store
                .snapshot()
                .alerts
                .iter()
                .any(|a| a.id == "acc-7:margin_call")
        })
        .await,
        "Margin call alert should be derived from the pushed update"
    );

    let state = store.snapshot();
    assert_eq!(state.accounts["acc-7"].status, AccountStatus::Danger);
    assert!(state.alerts.iter().any(|a| a.id == "acc-7:no_free_margin"));
    assert!(state.alerts.iter().any(|a| a.id == "acc-7:drawdown"));
    assert_eq!(app.alerts().active_alerts().len(), state.alerts.len());

    app.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_account_resumes_on_reconnect() {
    let source = Arc::new(MockAccountSource::failing());
    let mut config = app_config(None);
    config.api.retry_attempts = 1;

    let mut app =
        Application::with_source(config, source.clone(), SystemClock::shared()).unwrap();
    app.start().unwrap();
    assert_eq!(app.stream_status(), ConnectionState::Disconnected);

    let registry = app.registry().clone();
    assert!(
        wait_for(Duration::from_secs(3), || {
            registry.status("acc-1").is_some_and(|s| !s.auto_reconnect)
        })
        .await,
        "Retry budget should be exhausted"
    );
    let status = registry.status("acc-1").unwrap();
    assert_eq!(status.status, ConnectionState::Error);
    assert!(status.connection_error.is_some());

    // Parked: no further calls while waiting for a manual reconnect.
    let calls = source.calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(source.calls(), calls);

    source.set_failing(false);
    assert!(registry.reconnect_account("acc-1"));

    let store = app.store().clone();
    assert!(
        wait_for(Duration::from_secs(3), || store.snapshot().accounts.contains_key("acc-1")).await,
        "Account should be polled again after reconnect"
    );
    assert_eq!(registry.status("acc-1").unwrap().status, ConnectionState::Connected);

    app.stop().await;
}
