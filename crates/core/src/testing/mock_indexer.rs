//! Mock metadata indexer for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::item::Item;
use crate::metadata::{IndexedMetadata, MetadataError, MetadataIndexer};

/// Mock implementation of the MetadataIndexer trait.
///
/// Returns a configured result per item title, or an empty update that
/// keeps the item as requested. Queued errors are returned first.
#[derive(Debug, Default)]
pub struct MockIndexer {
    results: Arc<RwLock<HashMap<String, IndexedMetadata>>>,
    errors: Arc<RwLock<VecDeque<MetadataError>>>,
    indexed: Arc<RwLock<Vec<String>>>,
}

impl MockIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metadata returned for items with this title.
    pub async fn set_result(&self, title: &str, metadata: IndexedMetadata) {
        self.results.write().await.insert(title.to_string(), metadata);
    }

    /// Queue an error for the next call.
    pub async fn push_error(&self, error: MetadataError) {
        self.errors.write().await.push_back(error);
    }

    /// Ids of the items indexed so far, in call order.
    pub async fn indexed_items(&self) -> Vec<String> {
        self.indexed.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.indexed.read().await.len()
    }
}

#[async_trait]
impl MetadataIndexer for MockIndexer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn index(&self, item: &Item) -> Result<IndexedMetadata, MetadataError> {
        self.indexed.write().await.push(item.id.clone());
        if let Some(error) = self.errors.write().await.pop_front() {
            return Err(error);
        }
        Ok(self
            .results
            .read()
            .await
            .get(&item.title)
            .cloned()
            .unwrap_or_default())
    }
}
