//! Types for debrid download clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::Candidate;
use crate::retry::Transient;

/// What to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Info hash of the release.
    pub source_identifier: String,
    /// Release title, for logs.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl From<&Candidate> for DownloadRequest {
    fn from(candidate: &Candidate) -> Self {
        Self {
            source_identifier: candidate.source_identifier.clone(),
            title: candidate.raw_title.lines().next().unwrap_or_default().to_string(),
            filename: candidate.attributes.filename.clone(),
        }
    }
}

/// State of a release at the debrid service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Cached and reachable under `local_path`.
    Ready { local_path: String },
    /// Being fetched by the service.
    Pending { progress: f32 },
    /// Waiting in the service's queue.
    Queued,
    /// The service gave up on it.
    Failed { reason: String },
}

/// Errors from debrid clients.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Service not configured: {0}")]
    NotConfigured(String),
}

impl Transient for DownloadError {
    fn is_transient(&self) -> bool {
        match self {
            DownloadError::HttpError(e) => e.is_timeout() || e.is_connect(),
            DownloadError::RateLimitExceeded => true,
            DownloadError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A debrid-style service that turns an info hash into a local file.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    fn name(&self) -> &str;

    /// Add the release if the service does not know it yet, then report
    /// where it stands. Safe to call repeatedly for the same release.
    async fn resolve(&self, request: &DownloadRequest) -> Result<DownloadStatus, DownloadError>;
}
