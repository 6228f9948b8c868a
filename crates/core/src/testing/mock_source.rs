//! Mock candidate source for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ranking::RawRelease;
use crate::source::{CandidateQuery, CandidateSource, SourceError};

/// Mock implementation of the CandidateSource trait.
///
/// Releases are keyed by `(season, episode)` of the query; movie queries
/// use `(None, None)` and season-pack queries `(Some(s), None)`.
///
/// # Example
///
/// ```rust,ignore
/// let source = MockSource::new();
/// source.set_releases(None, None, vec![fixtures::release("abc", "Film.2020.1080p", 50, 8.0)]).await;
/// ```
#[derive(Debug, Default)]
pub struct MockSource {
    releases: Arc<RwLock<HashMap<(Option<u32>, Option<u32>), Vec<RawRelease>>>>,
    errors: Arc<RwLock<VecDeque<SourceError>>>,
    queries: Arc<RwLock<Vec<CandidateQuery>>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_releases(
        &self,
        season: Option<u32>,
        episode: Option<u32>,
        releases: Vec<RawRelease>,
    ) {
        self.releases
            .write()
            .await
            .insert((season, episode), releases);
    }

    /// Queue an error for the next fetch.
    pub async fn push_error(&self, error: SourceError) {
        self.errors.write().await.push_back(error);
    }

    pub async fn recorded_queries(&self) -> Vec<CandidateQuery> {
        self.queries.read().await.clone()
    }

    pub async fn clear_recorded_queries(&self) {
        self.queries.write().await.clear();
    }
}

#[async_trait]
impl CandidateSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, query: &CandidateQuery) -> Result<Vec<RawRelease>, SourceError> {
        self.queries.write().await.push(query.clone());
        if let Some(error) = self.errors.write().await.pop_front() {
            return Err(error);
        }
        Ok(self
            .releases
            .read()
            .await
            .get(&(query.season, query.episode))
            .cloned()
            .unwrap_or_default())
    }
}
