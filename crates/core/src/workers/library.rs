use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{StageOutcome, StageWorker};
use crate::eligibility::WorkUnit;
use crate::item::{ItemStore, PipelineStage};
use crate::library::LibraryMatcher;

/// Assigns the item to a library.
pub struct MatchWorker {
    store: Arc<dyn ItemStore>,
    matcher: Arc<dyn LibraryMatcher>,
}

impl MatchWorker {
    pub fn new(store: Arc<dyn ItemStore>, matcher: Arc<dyn LibraryMatcher>) -> Self {
        Self { store, matcher }
    }
}

#[async_trait]
impl StageWorker for MatchWorker {
    fn stage(&self) -> PipelineStage {
        PipelineStage::Match
    }

    async fn run(&self, unit: &WorkUnit) -> StageOutcome {
        let item = &unit.item;

        // No release is known yet, so resolution and codec filters see no hints.
        let assignment = match self.matcher.assign(item, None).await {
            Ok(assignment) => assignment,
            Err(e) => return StageOutcome::Terminal(e.to_string()),
        };

        if let Err(e) = self.store.save_library_assignment(
            &item.id,
            assignment.library.as_deref(),
            assignment.duplicate_in_main_library,
        ) {
            return e.into();
        }

        debug!(
            item_id = %item.id,
            library = assignment.library.as_deref().unwrap_or("main"),
            "Library matched"
        );
        StageOutcome::Success
    }
}
