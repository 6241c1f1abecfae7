//! Fan-out of store notifications to feed clients.
//!
//! A store subscription serializes each coalesced state once and pushes it
//! onto a broadcast channel that every WebSocket client reads from.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::store::{Store, Subscription};
use crate::types::FeedMessage;

/// Subscribe `tx` to the store. The initial callback is skipped; clients
/// get their own snapshot on connect.
pub fn attach_broadcaster(store: &Store, tx: broadcast::Sender<String>) -> Subscription {
    let initial = AtomicBool::new(true);
    store.subscribe(move |state| {
        if initial.swap(false, Ordering::AcqRel) {
            return;
        }

        if tx.receiver_count() == 0 {
            trace!("No feed receivers connected");
            return;
        }

        match serde_json::to_string(&FeedMessage::Update(state.clone())) {
            Ok(json) => {
                if let Ok(n) = tx.send(json) {
                    trace!(receivers = n, "Feed update sent");
                }
            }
            Err(e) => debug!(error = %e, "Failed to serialize feed update"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use livesync_core::ConnectionState;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcaster_forwards_updates_only() {
        let store = Store::new(Arc::new(ManualScheduler::new()));
        let (tx, mut rx) = broadcast::channel::<String>(16);
        let _sub = attach_broadcaster(&store, tx);

        assert!(rx.try_recv().is_err());

        store.set_connection_status(ConnectionState::Connected);
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"type\":\"update\""));
        assert!(msg.contains("\"connectionStatus\":\"connected\""));
    }
}
