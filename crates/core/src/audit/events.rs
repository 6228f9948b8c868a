use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Item lifecycle
    ItemCreated {
        item_id: String,
        title: String,
        media_kind: String,
        /// Who submitted the item ("api", "intake", ...)
        requested_by: String,
    },
    StageChanged {
        item_id: String,
        from_stage: String,
        to_stage: String,
        /// "advance", "fail", "exhaust", "reset" or "readmit"
        transition: String,
        retry_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A terminal failure was cleared by an operator.
    ItemReset {
        item_id: String,
        reset_by: String,
        previous_stage: String,
    },

    // Ranking
    CandidateSelected {
        item_id: String,
        /// Subject key ("movie", "episode:<id>", "season:<n>")
        subject: String,
        candidate_id: String,
        source_identifier: String,
        score: i64,
        /// Releases considered for this selection; zero for a promotion
        /// from the persisted pool.
        candidates_considered: u32,
        used_fallback: bool,
    },
    CandidateBlacklisted {
        item_id: String,
        subject: String,
        candidate_id: String,
        source_identifier: String,
        reason: String,
        /// Candidate promoted in its place, if the pool had one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replacement_id: Option<String>,
    },

    // Rescan
    ItemsReadmitted {
        item_ids: Vec<String>,
        episodes: u32,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::ItemCreated { .. } => "item_created",
            Self::StageChanged { .. } => "stage_changed",
            Self::ItemReset { .. } => "item_reset",
            Self::CandidateSelected { .. } => "candidate_selected",
            Self::CandidateBlacklisted { .. } => "candidate_blacklisted",
            Self::ItemsReadmitted { .. } => "items_readmitted",
        }
    }

    /// Extract item_id if this event concerns a single item
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::ItemCreated { item_id, .. }
            | Self::StageChanged { item_id, .. }
            | Self::ItemReset { item_id, .. }
            | Self::CandidateSelected { item_id, .. }
            | Self::CandidateBlacklisted { item_id, .. } => Some(item_id),
            _ => None,
        }
    }

    /// Stage a change landed on, or the terminal stage a reset cleared.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageChanged { to_stage, .. } => Some(to_stage),
            Self::ItemReset { previous_stage, .. } => Some(previous_stage),
            _ => None,
        }
    }

    /// Kind of stage edge ("advance", "fail", ...); resets count as "reset".
    pub fn transition(&self) -> Option<&str> {
        match self {
            Self::StageChanged { transition, .. } => Some(transition),
            Self::ItemReset { .. } => Some("reset"),
            _ => None,
        }
    }

    /// Subject key of a candidate decision.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::CandidateSelected { subject, .. } | Self::CandidateBlacklisted { subject, .. } => {
                Some(subject)
            }
            _ => None,
        }
    }

    /// Extract the actor if this event was triggered by an operator
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::ItemCreated { requested_by, .. } => Some(requested_by),
            Self::ItemReset { reset_by, .. } => Some(reset_by),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub item_id: Option<String>,
    pub actor: Option<String>,
    pub data: AuditEvent,
}
