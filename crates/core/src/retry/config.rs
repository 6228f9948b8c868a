//! Backoff configuration.

use serde::{Deserialize, Serialize};

/// Exponential backoff shared by stage retries and collaborator fetch retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay() -> u64 {
    30_000 // 30 seconds
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

/// Bounded retry for transient collaborator errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRetryConfig {
    #[serde(default = "default_fetch_attempts")]
    pub max_retries: u32,

    #[serde(default = "default_fetch_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_fetch_max_delay")]
    pub max_delay_ms: u64,
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_initial_delay() -> u64 {
    500
}

fn default_fetch_max_delay() -> u64 {
    10_000
}

impl Default for FetchRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_fetch_attempts(),
            initial_delay_ms: default_fetch_initial_delay(),
            max_delay_ms: default_fetch_max_delay(),
        }
    }
}
