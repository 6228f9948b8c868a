//! Mock publisher for testing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::publisher::{PublishError, PublishRequest, PublishResult, Publisher};

/// A recorded publish for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub item_id: String,
    pub candidate_id: String,
    pub season_number: Option<u32>,
    pub success: bool,
}

/// Mock implementation of the Publisher trait.
#[derive(Debug, Default)]
pub struct MockPublisher {
    publishes: Arc<RwLock<Vec<RecordedPublish>>>,
    next_error: Arc<RwLock<Option<PublishError>>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded_publishes(&self) -> Vec<RecordedPublish> {
        self.publishes.read().await.clone()
    }

    pub async fn publish_count(&self) -> usize {
        self.publishes.read().await.len()
    }

    /// Configure the next publish to fail with the given error.
    pub async fn set_next_error(&self, error: PublishError) {
        *self.next_error.write().await = Some(error);
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let error = self.next_error.write().await.take();
        self.publishes.write().await.push(RecordedPublish {
            item_id: request.item.id.clone(),
            candidate_id: request.candidate.id.clone(),
            season_number: request.season_number,
            success: error.is_none(),
        });
        if let Some(error) = error {
            return Err(error);
        }

        let file = request
            .candidate
            .local_path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("file")
            .to_string();
        Ok(PublishResult {
            links: vec![PathBuf::from("/library")
                .join(&request.item.title)
                .join(file)],
        })
    }
}
