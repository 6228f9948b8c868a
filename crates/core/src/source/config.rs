//! Candidate source configuration.

use serde::{Deserialize, Serialize};

use crate::retry::FetchRetryConfig;

/// Torrentio-style stream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentioConfig {
    /// Base URL of the endpoint.
    #[serde(default = "default_url")]
    pub url: String,

    /// Provider option path segment ("sort=qualitysize|qualityfilter=cam").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Minimum spacing between requests in milliseconds.
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Spacing ceiling after repeated rate-limit responses.
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    #[serde(default)]
    pub retry: FetchRetryConfig,
}

fn default_url() -> String {
    "https://torrentio.strem.fun".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_min_interval() -> u64 {
    2000 // 2 seconds
}

fn default_max_interval() -> u64 {
    60_000 // 1 minute
}

impl Default for TorrentioConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            options: None,
            timeout_secs: default_timeout(),
            min_interval_ms: default_min_interval(),
            max_interval_ms: default_max_interval(),
            retry: FetchRetryConfig::default(),
        }
    }
}
