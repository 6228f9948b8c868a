//! Retry and backoff.
//!
//! Stage failures are counted on the item and scheduled through
//! `retry_after`, so the budget survives restarts. The same policy bounds
//! retries of transient collaborator errors.

mod config;
mod policy;

pub use config::{BackoffConfig, FetchRetryConfig};
pub use policy::{retry_with_backoff, RetryDecision, RetryPolicy, Transient};
