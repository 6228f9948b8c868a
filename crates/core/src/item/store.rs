//! Item storage trait and query types.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::types::{
    Candidate, CandidateStatus, Claim, Item, ItemStage, MediaKind, MetadataUpdate, NewItem,
    NewSeason, PipelineStage, SeasonWithEpisodes, SelectionRecord, StageUpdate, SubjectRef,
};

/// Errors from the item store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Candidate not found: {0}")]
    CandidateNotFound(String),

    /// The item moved since the caller read it.
    #[error("Stage conflict for item {item_id}: expected {expected}, found {actual}")]
    StageConflict {
        item_id: String,
        expected: ItemStage,
        actual: ItemStage,
    },

    #[error("Illegal stage transition for item {item_id}: {from} -> {to}")]
    IllegalTransition {
        item_id: String,
        from: ItemStage,
        to: ItemStage,
    },

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Database(format!("serialization: {}", e))
    }
}

/// Filter for querying items.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub stages: Vec<ItemStage>,
    pub media_kind: Option<MediaKind>,
    /// Only items whose `retry_after` is unset or not after this instant.
    pub ready_at: Option<DateTime<Utc>>,
    /// Exclude items holding a live claim for any stage at this instant.
    pub unclaimed_at: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl ItemFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage: ItemStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_stages(mut self, stages: impl IntoIterator<Item = ItemStage>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn with_media_kind(mut self, kind: MediaKind) -> Self {
        self.media_kind = Some(kind);
        self
    }

    pub fn ready_at(mut self, now: DateTime<Utc>) -> Self {
        self.ready_at = Some(now);
        self
    }

    pub fn unclaimed_at(mut self, now: DateTime<Utc>) -> Self {
        self.unclaimed_at = Some(now);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Result of an intake upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub item: Item,
    pub created: bool,
}

/// Persistence for items, their season tree, candidates, blacklist and claims.
///
/// The store is the only arbiter of concurrent stage claims.
pub trait ItemStore: Send + Sync {
    /// Insert an item, or return the existing one keyed by external id or
    /// by (title, year).
    fn upsert_item(&self, item: NewItem) -> Result<UpsertOutcome, StoreError>;

    fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError>;

    fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, StoreError>;

    fn count_items(&self, filter: &ItemFilter) -> Result<i64, StoreError>;

    /// Item counts grouped by current stage.
    fn count_by_stage(&self) -> Result<Vec<(ItemStage, i64)>, StoreError>;

    fn save_metadata(&self, item_id: &str, update: &MetadataUpdate) -> Result<(), StoreError>;

    fn save_library_assignment(
        &self,
        item_id: &str,
        library: Option<&str>,
        duplicate_in_main_library: bool,
    ) -> Result<(), StoreError>;

    /// Compare-and-set stage change. Fails with `StageConflict` if the item
    /// is no longer at `update.from`, and with `IllegalTransition` for edges
    /// the state machine does not allow.
    fn apply_stage_update(&self, item_id: &str, update: &StageUpdate)
        -> Result<Item, StoreError>;

    /// Insert or refresh seasons and episodes. Scrape state of existing
    /// episodes is preserved.
    fn upsert_seasons(&self, item_id: &str, seasons: &[NewSeason]) -> Result<(), StoreError>;

    fn list_seasons(&self, item_id: &str) -> Result<Vec<SeasonWithEpisodes>, StoreError>;

    /// Persist a ranked candidate list and its winner. Any previously
    /// selected candidate for the same subject, or for the covered episodes,
    /// is demoted to `rejected`.
    fn record_selection(
        &self,
        item_id: &str,
        selection: &SelectionRecord,
    ) -> Result<Candidate, StoreError>;

    /// Promote a persisted candidate to `selected` for its subject.
    fn promote_candidate(
        &self,
        candidate_id: &str,
        episode_ids: &[String],
    ) -> Result<Candidate, StoreError>;

    fn get_candidate(&self, id: &str) -> Result<Option<Candidate>, StoreError>;

    fn list_candidates(
        &self,
        item_id: &str,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<Candidate>, StoreError>;

    fn update_candidate_status(
        &self,
        candidate_id: &str,
        status: CandidateStatus,
        local_path: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Mark a candidate blacklisted and exclude its source for the item.
    fn blacklist_candidate(&self, candidate_id: &str, reason: &str)
        -> Result<Candidate, StoreError>;

    fn blacklisted_sources(&self, item_id: &str) -> Result<HashSet<String>, StoreError>;

    /// Push back `retry_after` while the item still sits at `stage`. The
    /// stage and retry count are left alone. Returns false if the stage moved.
    fn defer_item(
        &self,
        item_id: &str,
        stage: ItemStage,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Mark episodes as needing a new selection.
    fn clear_episode_selection(&self, episode_ids: &[String]) -> Result<(), StoreError>;

    /// Take the claim for (item, stage) unless the item holds a live claim
    /// for any stage. An expired claim is taken over.
    fn try_claim(
        &self,
        item_id: &str,
        stage: PipelineStage,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Claim>, StoreError>;

    /// Drop a claim if it is still the one we hold.
    fn release_claim(&self, claim: &Claim) -> Result<(), StoreError>;

    /// Item ids holding a live claim for the stage.
    fn claimed_items(
        &self,
        stage: PipelineStage,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError>;
}

/// Episodes whose active candidate is the given subject's selection.
pub fn covered_by<'a>(subject: &SubjectRef, seasons: &'a [SeasonWithEpisodes]) -> Vec<&'a str> {
    match subject {
        SubjectRef::Movie => Vec::new(),
        SubjectRef::Episode { episode_id } => seasons
            .iter()
            .flat_map(|s| s.episodes.iter())
            .filter(|e| &e.id == episode_id)
            .map(|e| e.id.as_str())
            .collect(),
        SubjectRef::Season { season_number } => seasons
            .iter()
            .filter(|s| s.season.season_number == *season_number)
            .flat_map(|s| s.episodes.iter().map(|e| e.id.as_str()))
            .collect(),
    }
}
