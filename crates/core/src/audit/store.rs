use chrono::{DateTime, Utc};
use thiserror::Error;

use super::AuditRecord;

/// Page size when a filter does not set one.
pub const DEFAULT_AUDIT_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which end of the trail a query reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuditOrder {
    #[default]
    NewestFirst,
    /// Replay order, used for an item's history.
    OldestFirst,
}

/// Filter over the pipeline event trail. Every set field must match.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub item_id: Option<String>,
    pub event_type: Option<String>,
    pub actor: Option<String>,
    /// Stage a change landed on (or the stage a reset cleared).
    pub stage: Option<String>,
    /// "advance", "fail", "exhaust", "reset" or "readmit".
    pub transition: Option<String>,
    /// Candidate subject key ("movie", "episode:<id>", "season:<n>").
    pub subject: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: AuditOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            item_id: None,
            event_type: None,
            actor: None,
            stage: None,
            transition: None,
            subject: None,
            from: None,
            to: None,
            order: AuditOrder::default(),
            limit: DEFAULT_AUDIT_LIMIT,
            offset: 0,
        }
    }
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_transition(mut self, transition: impl Into<String>) -> Self {
        self.transition = Some(transition.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_order(mut self, order: AuditOrder) -> Self {
        self.order = order;
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

/// Storage for the pipeline event trail. Records are append-only.
pub trait AuditStore: Send + Sync {
    /// Append a record and return its id. Ids grow with insertion order.
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError>;

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Matching records, ignoring `limit`, `offset` and `order`.
    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError>;

    /// One item's trail in the order it happened.
    fn item_history(&self, item_id: &str, limit: i64) -> Result<Vec<AuditRecord>, AuditError> {
        self.query(
            &AuditFilter::new()
                .with_item_id(item_id)
                .with_order(AuditOrder::OldestFirst)
                .with_limit(limit),
        )
    }
}
