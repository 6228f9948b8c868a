use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{StageOutcome, StageWorker};
use crate::eligibility::WorkUnit;
use crate::item::{ItemStore, PipelineStage};
use crate::metadata::{MetadataError, MetadataIndexer};

/// Resolves canonical metadata and the season tree.
pub struct IndexWorker {
    store: Arc<dyn ItemStore>,
    indexer: Arc<dyn MetadataIndexer>,
}

impl IndexWorker {
    pub fn new(store: Arc<dyn ItemStore>, indexer: Arc<dyn MetadataIndexer>) -> Self {
        Self { store, indexer }
    }
}

#[async_trait]
impl StageWorker for IndexWorker {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Index
    }

    async fn run(&self, unit: &WorkUnit) -> StageOutcome {
        let item = &unit.item;

        let indexed = match self.indexer.index(item).await {
            Ok(indexed) => indexed,
            Err(MetadataError::NotConfigured(reason)) => {
                return StageOutcome::Terminal(format!("indexer not configured: {}", reason));
            }
            Err(e) => {
                warn!(item_id = %item.id, indexer = self.indexer.name(), error = %e, "Indexing failed");
                return StageOutcome::Retryable(e.to_string());
            }
        };

        if item.is_series() && indexed.seasons.is_empty() {
            return StageOutcome::Retryable("series metadata has no seasons".to_string());
        }

        if let Err(e) = self.store.save_metadata(&item.id, &indexed.update) {
            return e.into();
        }
        if item.is_series() {
            if let Err(e) = self.store.upsert_seasons(&item.id, &indexed.seasons) {
                return e.into();
            }
        }

        debug!(
            item_id = %item.id,
            seasons = indexed.seasons.len(),
            "Indexed"
        );
        StageOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::DispatchMode;
    use crate::item::{MetadataUpdate, NewItem, SqliteItemStore};
    use crate::metadata::IndexedMetadata;
    use crate::testing::{fixtures, MockIndexer};

    fn unit(store: &SqliteItemStore, item: NewItem) -> WorkUnit {
        let item = store.upsert_item(item).unwrap().item;
        WorkUnit {
            item,
            stage: PipelineStage::Index,
            mode: DispatchMode::Advance,
        }
    }

    #[tokio::test]
    async fn test_writes_metadata_and_seasons() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let indexer = Arc::new(MockIndexer::new());
        let mut update = MetadataUpdate {
            year: Some(2019),
            ..Default::default()
        };
        update.external_ids.imdb = Some("tt99".to_string());
        indexer
            .set_result(
                "Show",
                IndexedMetadata {
                    update,
                    seasons: vec![fixtures::aired_season(1, 3)],
                },
            )
            .await;

        let worker = IndexWorker::new(store.clone(), indexer);
        let unit = unit(&store, NewItem::series("Show", None));
        assert_eq!(worker.run(&unit).await, StageOutcome::Success);

        let item = store.get_item(&unit.item.id).unwrap().unwrap();
        assert_eq!(item.year, Some(2019));
        assert_eq!(item.external_ids.imdb.as_deref(), Some("tt99"));
        let seasons = store.list_seasons(&item.id).unwrap();
        assert_eq!(seasons[0].episodes.len(), 3);
    }

    #[tokio::test]
    async fn test_series_without_seasons_is_retryable() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let worker = IndexWorker::new(store.clone(), Arc::new(MockIndexer::new()));
        let unit = unit(&store, NewItem::series("Show", None));

        assert!(matches!(
            worker.run(&unit).await,
            StageOutcome::Retryable(_)
        ));
    }

    #[tokio::test]
    async fn test_indexer_errors_map_to_outcomes() {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let indexer = Arc::new(MockIndexer::new());
        indexer.push_error(MetadataError::RateLimitExceeded).await;
        indexer
            .push_error(MetadataError::NotConfigured("no api key".to_string()))
            .await;

        let worker = IndexWorker::new(store.clone(), indexer);
        let unit = unit(&store, NewItem::movie("Film", Some(2020)));

        assert!(matches!(worker.run(&unit).await, StageOutcome::Retryable(_)));
        assert!(matches!(worker.run(&unit).await, StageOutcome::Terminal(_)));
        assert_eq!(worker.run(&unit).await, StageOutcome::Success);
    }
}
