//! Shared test utilities for reconciliation and chaos tests.
//!
//! This module provides:
//! - A recording node adapter with failure injection
//! - A two-site harness (config store, registry, ledger, event channel)
//! - Record helpers

#[allow(dead_code)]
pub mod harness;
#[allow(dead_code)]
pub mod mock_adapter;

pub use harness::*;
pub use mock_adapter::*;
