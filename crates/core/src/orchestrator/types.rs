//! Types for the pipeline orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::item::{ItemStage, PipelineStage, StoreError};

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Item not found.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// Invalid item stage for operation.
    #[error("invalid item stage: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: ItemStage },

    /// No worker registered for the stage.
    #[error("no worker registered for stage {0}")]
    NoWorker(PipelineStage),

    /// Item store error.
    #[error("item store error: {0}")]
    Store(#[from] StoreError),
}

/// What happened to one dispatched work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitResult {
    Advanced,
    Retrying,
    Exhausted,
    /// Subject-mode success; the item kept its stage.
    Unchanged,
    /// Still in progress remotely; polled again later at the same retry count.
    Waiting,
    /// The claim or the item's stage moved under us.
    Lost,
}

impl UnitResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitResult::Advanced => "advanced",
            UnitResult::Retrying => "retry",
            UnitResult::Exhausted => "exhausted",
            UnitResult::Unchanged => "unchanged",
            UnitResult::Waiting => "waiting",
            UnitResult::Lost => "lost",
        }
    }
}

/// Summary of one stage tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Work units the resolver returned.
    pub resolved: usize,
    pub advanced: usize,
    pub retrying: usize,
    pub exhausted: usize,
    pub unchanged: usize,
    pub waiting: usize,
    pub lost: usize,
}

impl TickReport {
    pub(crate) fn record(&mut self, result: UnitResult) {
        match result {
            UnitResult::Advanced => self.advanced += 1,
            UnitResult::Retrying => self.retrying += 1,
            UnitResult::Exhausted => self.exhausted += 1,
            UnitResult::Unchanged => self.unchanged += 1,
            UnitResult::Waiting => self.waiting += 1,
            UnitResult::Lost => self.lost += 1,
        }
    }

    /// Units that reached a worker.
    pub fn dispatched(&self) -> usize {
        self.advanced + self.retrying + self.exhausted + self.unchanged + self.waiting
    }
}

/// Summary of one rescan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    /// Series looked at.
    pub examined: usize,
    /// Items moved back to `library_matched`.
    pub readmitted: Vec<String>,
    /// Aired, unscraped episodes across the readmitted items.
    pub episodes: u32,
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStatus {
    /// Whether the stage loops are running.
    pub running: bool,
    /// Stages with an active loop and a registered worker.
    pub active_stages: Vec<PipelineStage>,
    /// Last tick start per stage.
    pub last_ticks: BTreeMap<PipelineStage, DateTime<Utc>>,
    pub last_rescan: Option<DateTime<Utc>>,
    /// Item counts keyed by stage name.
    pub items_by_stage: BTreeMap<String, i64>,
}
