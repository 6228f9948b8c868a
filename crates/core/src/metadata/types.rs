//! Types for metadata indexing.

use async_trait::async_trait;
use thiserror::Error;

use crate::item::{Item, MetadataUpdate, NewSeason};
use crate::retry::Transient;

/// Everything the index stage writes back for one item.
#[derive(Debug, Clone, Default)]
pub struct IndexedMetadata {
    pub update: MetadataUpdate,
    /// Season tree (series only).
    pub seasons: Vec<NewSeason>,
}

/// Errors from metadata indexers.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Service not configured: {0}")]
    NotConfigured(String),
}

impl Transient for MetadataError {
    fn is_transient(&self) -> bool {
        match self {
            MetadataError::HttpError(e) => e.is_timeout() || e.is_connect(),
            MetadataError::RateLimitExceeded => true,
            MetadataError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Resolves canonical metadata for an item.
#[async_trait]
pub trait MetadataIndexer: Send + Sync {
    /// Provider name for logging/audit.
    fn name(&self) -> &str;

    /// Look the item up by its external ids, falling back to title and year.
    async fn index(&self, item: &Item) -> Result<IndexedMetadata, MetadataError>;
}
