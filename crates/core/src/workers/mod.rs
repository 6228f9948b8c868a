//! Stage workers.
//!
//! A worker performs one stage for one item and reports an outcome. It never
//! changes the item's stage or retry count; the orchestrator applies the
//! outcome. Workers may run more than once for the same item and stage.

mod download;
mod index;
mod library;
mod publish;
mod scrape;

use async_trait::async_trait;
use serde::Serialize;

use crate::eligibility::WorkUnit;
use crate::item::{PipelineStage, StoreError};

pub use download::DownloadWorker;
pub use index::IndexWorker;
pub use library::MatchWorker;
pub use publish::PublishWorker;
pub use scrape::ScrapeWorker;

/// Result of running a stage worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    /// The stage produced nothing usable this time; retry after backoff.
    Retryable(String),
    /// Work is progressing at a remote service. Poll again later without
    /// spending a retry.
    Waiting(String),
    /// Retrying cannot help; freeze the item.
    Terminal(String),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StageOutcome::Success => None,
            StageOutcome::Retryable(reason)
            | StageOutcome::Waiting(reason)
            | StageOutcome::Terminal(reason) => Some(reason),
        }
    }
}

impl From<StoreError> for StageOutcome {
    fn from(e: StoreError) -> Self {
        StageOutcome::Retryable(format!("store error: {}", e))
    }
}

/// Performs one pipeline stage.
#[async_trait]
pub trait StageWorker: Send + Sync {
    fn stage(&self) -> PipelineStage;

    async fn run(&self, unit: &WorkUnit) -> StageOutcome;
}
