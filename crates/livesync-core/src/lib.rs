//! Core domain types for the livesync dashboard pipeline.
//!
//! This crate provides the vocabulary shared by every pipeline stage:
//! - `Message`: typed push envelope (`ACCOUNT_UPDATE`, `PRICE_UPDATE`, ...)
//! - `AccountSnapshot`, `PositionSnapshot`, `PriceSnapshot`, `SystemStatus`
//! - `AccountStatus`: margin-level health class derived at ingestion
//! - `ConnectionState`, `ConnectionQuality`: transport health tiers
//! - `BackoffPolicy`: exponential backoff shared by every retry loop
//! - `Clock`: injectable time source for deterministic tests

pub mod backoff;
pub mod clock;
pub mod connection;
pub mod error;
pub mod message;
pub mod snapshot;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use connection::{ConnectionQuality, ConnectionState};
pub use error::{CoreError, Result};
pub use message::{Message, MessageKind};
pub use snapshot::{
    AccountSnapshot, AccountStatus, PositionSide, PositionSnapshot, PriceSnapshot, SystemStatus,
};
