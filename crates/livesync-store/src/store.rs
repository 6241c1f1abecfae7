//! Coalescing publish/subscribe store.
//!
//! Messages are decoded into deltas and queued. The first delta of a burst
//! schedules one flush; the flush applies every queued delta in arrival
//! order and then notifies subscribers once. `set_connection_status` and
//! `clear` bypass the queue and notify immediately.
//!
//! Subscriber callbacks run without any state lock held, so they may call
//! back into the store. A panic in one callback or message handler is
//! caught and logged; later subscribers and messages are unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use livesync_alerts::Alert;
use livesync_core::{
    AccountSnapshot, ConnectionState, Message, MessageKind, PositionSnapshot, PriceSnapshot,
    SystemStatus,
};
use livesync_registry::ConnectionStatus;
use livesync_telemetry::Metrics;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::scheduler::FlushScheduler;
use crate::types::{StoreState, StoreStats};

/// Whole-state subscriber callback.
pub type StateCallback = Arc<dyn Fn(&StoreState) + Send + Sync>;

/// Per-message handler.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// One queued change.
#[derive(Debug, Clone)]
enum Delta {
    Account(AccountSnapshot),
    Position(PositionSnapshot),
    ClosePosition(String),
    Price(PriceSnapshot),
    System(SystemStatus),
    EntityConnection(ConnectionStatus),
    Alerts(Vec<Alert>),
}

impl Delta {
    fn apply(self, state: &mut StoreState) {
        match self {
            Self::Account(account) => {
                state.accounts.insert(account.account_id.clone(), account);
            }
            Self::Position(position) => {
                state.positions.insert(position.position_id.clone(), position);
            }
            Self::ClosePosition(position_id) => {
                state.positions.remove(&position_id);
            }
            Self::Price(price) => {
                state.prices.insert(price.symbol.clone(), price);
            }
            Self::System(status) => {
                state.system_status.insert(status.component.clone(), status);
            }
            Self::EntityConnection(status) => {
                state.entity_connections.insert(status.entity_id.clone(), status);
            }
            Self::Alerts(alerts) => {
                state.alerts = alerts;
            }
        }
    }
}

/// Pending-flush flag plus the queue of deltas.
#[derive(Default)]
struct PendingBatch {
    deltas: Vec<Delta>,
    flush_scheduled: bool,
}

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: StateCallback,
}

struct MessageSubscriber {
    id: u64,
    kind: MessageKind,
    active: Arc<AtomicBool>,
    handler: MessageHandler,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    notifications: AtomicU64,
}

struct StoreInner {
    state: RwLock<StoreState>,
    pending: Mutex<PendingBatch>,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    message_handlers: RwLock<Vec<Arc<MessageSubscriber>>>,
    /// Serializes deliveries so subscribers see states in order.
    delivery: ReentrantMutex<()>,
    scheduler: Arc<dyn FlushScheduler>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Handle returned by `subscribe` and `on_message`.
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
    active: Arc<AtomicBool>,
    kind: SubscriptionKind,
}

#[derive(Clone, Copy)]
enum SubscriptionKind {
    State,
    Message,
}

impl Subscription {
    /// Stop deliveries. Safe to call repeatedly and from inside a callback.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        match self.kind {
            SubscriptionKind::State => store.subscribers.write().retain(|s| s.id != self.id),
            SubscriptionKind::Message => {
                store.message_handlers.write().retain(|s| s.id != self.id)
            }
        }
        trace!(id = self.id, "Unsubscribed");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Live-data store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store that flushes through `scheduler`.
    pub fn new(scheduler: Arc<dyn FlushScheduler>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::default()),
                pending: Mutex::new(PendingBatch::default()),
                subscribers: RwLock::new(Vec::new()),
                message_handlers: RwLock::new(Vec::new()),
                delivery: ReentrantMutex::new(()),
                scheduler,
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Route one message. Handlers registered with `on_message` run now;
    /// the state change is queued for the next flush.
    ///
    /// Undecodable payloads and unknown kinds are logged and dropped.
    pub fn process_message(&self, msg: &Message) {
        self.dispatch_handlers(msg);

        match to_delta(msg) {
            Ok(Some(delta)) => {
                self.inner.counters.processed.fetch_add(1, Ordering::Relaxed);
                Metrics::message_processed(msg.kind.as_str());
                self.enqueue(delta);
            }
            Ok(None) => {
                trace!(kind = %msg.kind, "Control message, no state change");
            }
            Err(reason) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Metrics::message_dropped(reason.label());
                warn!(
                    kind = %msg.kind,
                    correlation_id = %msg.correlation_id,
                    reason = %reason,
                    "Dropping message"
                );
            }
        }
    }

    /// Register a whole-state callback.
    ///
    /// The callback runs once, synchronously, with the current state and
    /// then once per coalesced change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreState) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Arc::new(Subscriber {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        });

        {
            let _delivery = self.inner.delivery.lock();
            self.inner.subscribers.write().push(subscriber.clone());
            let snapshot = self.inner.state.read().clone();
            deliver(&subscriber, &snapshot);
        }

        debug!(id, "State subscriber added");
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
            active,
            kind: SubscriptionKind::State,
        }
    }

    /// Register an uncoalesced handler for one message kind.
    pub fn on_message<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.message_handlers.write().push(Arc::new(MessageSubscriber {
            id,
            kind,
            active: active.clone(),
            handler: Arc::new(handler),
        }));

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
            active,
            kind: SubscriptionKind::Message,
        }
    }

    /// Set the push transport state and notify immediately.
    pub fn set_connection_status(&self, status: ConnectionState) {
        {
            let mut state = self.inner.state.write();
            if state.connection_status == status {
                return;
            }
            state.connection_status = status;
            state.last_update = Some(Utc::now());
        }
        debug!(%status, "Connection status set");
        self.inner.notify();
    }

    /// Queue a per-entity pull connection update.
    pub fn update_entity_connection(&self, status: ConnectionStatus) {
        self.enqueue(Delta::EntityConnection(status));
    }

    /// Queue a replacement of the alert list.
    pub fn set_alerts(&self, alerts: Vec<Alert>) {
        self.enqueue(Delta::Alerts(alerts));
    }

    /// Reset every map and the connection status, dropping queued deltas.
    /// Notifies once.
    pub fn clear(&self) {
        {
            let mut pending = self.inner.pending.lock();
            pending.deltas.clear();
        }
        *self.inner.state.write() = StoreState::default();
        debug!("Store cleared");
        self.inner.notify();
    }

    /// Apply queued deltas and notify once. No-op when nothing is queued.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> StoreState {
        self.inner.state.read().clone()
    }

    pub fn stats(&self) -> StoreStats {
        let counters = &self.inner.counters;
        StoreStats {
            messages_processed: counters.processed.load(Ordering::Relaxed),
            messages_dropped: counters.dropped.load(Ordering::Relaxed),
            notifications: counters.notifications.load(Ordering::Relaxed),
            pending_deltas: self.inner.pending.lock().deltas.len(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    fn enqueue(&self, delta: Delta) {
        let schedule = {
            let mut pending = self.inner.pending.lock();
            pending.deltas.push(delta);
            !std::mem::replace(&mut pending.flush_scheduled, true)
        };

        if schedule {
            let store = Arc::downgrade(&self.inner);
            self.inner.scheduler.schedule(Box::new(move || {
                if let Some(inner) = store.upgrade() {
                    inner.flush();
                }
            }));
        }
    }

    fn dispatch_handlers(&self, msg: &Message) {
        let handlers: Vec<Arc<MessageSubscriber>> = self
            .inner
            .message_handlers
            .read()
            .iter()
            .filter(|h| h.kind == msg.kind)
            .cloned()
            .collect();

        for handler in handlers {
            if !handler.active.load(Ordering::Acquire) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (handler.handler)(msg)));
            if result.is_err() {
                error!(
                    id = handler.id,
                    kind = %msg.kind,
                    correlation_id = %msg.correlation_id,
                    "Message handler panicked"
                );
            }
        }
    }
}

impl StoreInner {
    fn flush(&self) {
        let deltas = {
            let mut pending = self.pending.lock();
            pending.flush_scheduled = false;
            std::mem::take(&mut pending.deltas)
        };
        if deltas.is_empty() {
            return;
        }

        let count = deltas.len();
        {
            let mut state = self.state.write();
            for delta in deltas {
                delta.apply(&mut state);
            }
            state.last_update = Some(Utc::now());
        }
        trace!(deltas = count, "Flushed batch");
        self.notify();
    }

    fn notify(&self) {
        let _delivery = self.delivery.lock();
        let snapshot = self.state.read().clone();
        let subscribers: Vec<Arc<Subscriber>> = self.subscribers.read().clone();

        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        Metrics::notification();

        for subscriber in &subscribers {
            deliver(subscriber, &snapshot);
        }
    }
}

fn deliver(subscriber: &Subscriber, state: &StoreState) {
    if !subscriber.active.load(Ordering::Acquire) {
        return;
    }
    let result = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(state)));
    if result.is_err() {
        error!(id = subscriber.id, "Subscriber callback panicked");
    }
}

/// Why a message was dropped.
#[derive(Debug)]
enum DropReason {
    Unknown(String),
    Invalid(String),
}

impl DropReason {
    fn label(&self) -> &'static str {
        match self {
            Self::Unknown(_) => "unknown_kind",
            Self::Invalid(_) => "invalid_payload",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(kind) => write!(f, "unknown message type {kind}"),
            Self::Invalid(reason) => f.write_str(reason),
        }
    }
}

/// Decode a message into a state change. Account status is derived here.
fn to_delta(msg: &Message) -> Result<Option<Delta>, DropReason> {
    let invalid = |e: livesync_core::CoreError| DropReason::Invalid(e.to_string());

    let delta = match &msg.kind {
        MessageKind::AccountUpdate => {
            let account: AccountSnapshot = msg.decode_data().map_err(invalid)?;
            Delta::Account(account.with_derived_status())
        }
        MessageKind::PositionUpdate => {
            let position: PositionSnapshot = msg.decode_data().map_err(invalid)?;
            if position.volume.is_zero() {
                Delta::ClosePosition(position.position_id)
            } else {
                Delta::Position(position)
            }
        }
        MessageKind::PriceUpdate => Delta::Price(msg.decode_data().map_err(invalid)?),
        MessageKind::SystemStatus => Delta::System(msg.decode_data().map_err(invalid)?),
        MessageKind::Heartbeat | MessageKind::Ping | MessageKind::Pong => return Ok(None),
        MessageKind::Unknown(kind) => return Err(DropReason::Unknown(kind.clone())),
    };
    Ok(Some(delta))
}
