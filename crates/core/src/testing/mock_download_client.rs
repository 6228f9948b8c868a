//! Mock debrid client for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::downloader::{DownloadClient, DownloadError, DownloadRequest, DownloadStatus};

/// Mock implementation of the DownloadClient trait.
///
/// Releases without a configured status resolve as ready under
/// `/mnt/mock/<source_identifier>`.
#[derive(Debug, Default)]
pub struct MockDownloadClient {
    statuses: Arc<RwLock<HashMap<String, DownloadStatus>>>,
    errors: Arc<RwLock<VecDeque<DownloadError>>>,
    requests: Arc<RwLock<Vec<DownloadRequest>>>,
}

impl MockDownloadClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status reported for a release.
    pub async fn set_status(&self, source_identifier: &str, status: DownloadStatus) {
        self.statuses
            .write()
            .await
            .insert(source_identifier.to_string(), status);
    }

    /// Queue an error for the next call.
    pub async fn push_error(&self, error: DownloadError) {
        self.errors.write().await.push_back(error);
    }

    pub async fn recorded_requests(&self) -> Vec<DownloadRequest> {
        self.requests.read().await.clone()
    }

    /// Source identifiers requested so far, in call order.
    pub async fn requested_sources(&self) -> Vec<String> {
        self.requests
            .read()
            .await
            .iter()
            .map(|r| r.source_identifier.clone())
            .collect()
    }
}

#[async_trait]
impl DownloadClient for MockDownloadClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn resolve(&self, request: &DownloadRequest) -> Result<DownloadStatus, DownloadError> {
        self.requests.write().await.push(request.clone());
        if let Some(error) = self.errors.write().await.pop_front() {
            return Err(error);
        }
        let status = self
            .statuses
            .read()
            .await
            .get(&request.source_identifier)
            .cloned();
        Ok(status.unwrap_or_else(|| DownloadStatus::Ready {
            local_path: format!("/mnt/mock/{}", request.source_identifier),
        }))
    }
}
