//! `parallel-sign` library.
//!
//! Benchmarks concurrent "sign raw payload" requests against a remote
//! key-management API. The credential provider (`provider`, `stamper`,
//! `isolated`, `bundle`) produces a stamper from the persisted
//! configuration (`config`); the harness (`harness`, `fan_out`, `client`,
//! `request`) performs one identity check, fans out `N` requests, and times
//! the barrier.
//!
//! Invariants:
//! - all `N` requests are built and in flight before any is awaited
//! - the first failing request fails the run; there is no partial result
//! - at most one isolated context exists per host at any time

pub mod bundle;
pub mod client;
pub mod config;
pub mod error;
pub mod fan_out;
pub mod harness;
pub mod isolated;
pub mod mock_api;
pub mod provider;
pub mod request;
pub mod stamper;

pub use error::{Result, SignError};
