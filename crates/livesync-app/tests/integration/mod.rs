//! Integration tests for livesync-app.
//!
//! These tests verify the interaction between components:
//! - Push connection lifecycle against a mock server
//! - Push and pull data reaching the store
//! - Alert derivation and per-account retry exhaustion

pub mod common;
