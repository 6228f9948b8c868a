//! Types for candidate sources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{Item, MediaKind};
use crate::ranking::RawRelease;
use crate::retry::Transient;

/// What to fetch candidates for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub media_kind: MediaKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    /// Unset for a season-pack query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

impl CandidateQuery {
    fn for_item(item: &Item) -> Self {
        Self {
            media_kind: item.media_kind,
            title: item.title.clone(),
            year: item.year,
            imdb_id: item.external_ids.imdb.clone(),
            tmdb_id: item.external_ids.tmdb,
            season: None,
            episode: None,
        }
    }

    pub fn movie(item: &Item) -> Self {
        Self::for_item(item)
    }

    pub fn episode(item: &Item, season: u32, episode: u32) -> Self {
        Self {
            season: Some(season),
            episode: Some(episode),
            ..Self::for_item(item)
        }
    }

    pub fn season_pack(item: &Item, season: u32) -> Self {
        Self {
            season: Some(season),
            ..Self::for_item(item)
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!("{} S{:02}E{:02}", self.title, s, e),
            (Some(s), None) => format!("{} S{:02}", self.title, s),
            _ => self.title.clone(),
        }
    }
}

/// Errors from candidate sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("No usable external id for {0}")]
    MissingId(String),

    #[error("Candidate source connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Candidate source API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        match self {
            SourceError::ConnectionFailed(_) | SourceError::RateLimited(_) | SourceError::Timeout => {
                true
            }
            SourceError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A provider of raw release listings.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Provider name for logging/audit.
    fn name(&self) -> &str;

    /// Fetch raw releases for one query. An empty list is not an error.
    async fn fetch(&self, query: &CandidateQuery) -> Result<Vec<RawRelease>, SourceError>;
}
