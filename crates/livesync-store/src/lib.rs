//! Live-data store and presentation feed for livesync.
//!
//! The `Store` ingests push messages and pull snapshots, merges bursts into
//! one notification per coalescing window, and exposes whole-state and
//! per-message subscriptions. The feed server publishes the same state to
//! browsers.
//!
//! ```text
//!  StreamIngress ──┐                    ┌──> subscribe(cb)
//!  AccountMonitor ─┼─> Store ─ flush ───┤
//!  AlertDeriver ───┘   (deltas queue)   └──> broadcast ──> GET /ws
//! ```

mod broadcast;
mod config;
mod error;
mod scheduler;
mod server;
mod store;
mod types;

pub use broadcast::attach_broadcaster;
pub use config::{ServerConfig, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use scheduler::{FlushScheduler, FlushTask, ManualScheduler, TokioScheduler};
pub use server::{create_router, run_server, ConnectionLimiter, ServerState};
pub use store::{MessageHandler, StateCallback, Store, Subscription};
pub use types::{FeedMessage, StoreState, StoreStats};
