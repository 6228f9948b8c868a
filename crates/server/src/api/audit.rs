use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use reelflow_core::{AuditError, AuditFilter, AuditOrder, AuditRecord};
use std::sync::Arc;

use crate::state::AppState;

/// Maximum allowed limit for audit queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for audit queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for audit endpoint
#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    /// Filter by item ID
    pub item_id: Option<String>,
    /// Filter by event type
    pub event_type: Option<String>,
    /// Filter by actor (operator or submitter)
    pub actor: Option<String>,
    /// Filter by the stage a change landed on
    pub stage: Option<String>,
    /// Filter by transition kind ("advance", "fail", "exhaust", "reset", "readmit")
    pub transition: Option<String>,
    /// Filter by candidate subject ("movie", "episode:<id>", "season:<n>")
    pub subject: Option<String>,
    /// "asc" for oldest first; newest first otherwise
    pub order: Option<String>,
    /// Filter events after this timestamp (ISO 8601)
    pub from: Option<DateTime<Utc>>,
    /// Filter events before this timestamp (ISO 8601)
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of events to return (default 100, max 1000)
    pub limit: Option<i64>,
    /// Pagination offset (default 0)
    pub offset: Option<i64>,
}

/// Response for audit query endpoint
#[derive(Debug, Serialize)]
pub struct AuditQueryResponse {
    /// List of audit events
    pub events: Vec<AuditRecord>,
    /// Total number of matching events
    pub total: i64,
    /// Limit used for this query
    pub limit: i64,
    /// Offset used for this query
    pub offset: i64,
}

/// Error response for audit queries
#[derive(Debug, Serialize)]
pub struct AuditErrorResponse {
    pub error: String,
}

fn query_failed(e: AuditError) -> (StatusCode, Json<AuditErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(AuditErrorResponse {
            error: format!("Failed to query audit events: {}", e),
        }),
    )
}

/// Query audit events, newest first unless `order=asc`
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditQueryResponse>, (StatusCode, Json<AuditErrorResponse>)> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    // Shared between the page query and the count
    let mut base_filter = AuditFilter::new();
    if let Some(ref item_id) = params.item_id {
        base_filter = base_filter.with_item_id(item_id);
    }
    if let Some(ref event_type) = params.event_type {
        base_filter = base_filter.with_event_type(event_type);
    }
    if let Some(ref actor) = params.actor {
        base_filter = base_filter.with_actor(actor);
    }
    if let Some(ref stage) = params.stage {
        base_filter = base_filter.with_stage(stage);
    }
    if let Some(ref transition) = params.transition {
        base_filter = base_filter.with_transition(transition);
    }
    if let Some(ref subject) = params.subject {
        base_filter = base_filter.with_subject(subject);
    }
    if params.order.as_deref() == Some("asc") {
        base_filter = base_filter.with_order(AuditOrder::OldestFirst);
    }
    if params.from.is_some() || params.to.is_some() {
        base_filter = base_filter.with_time_range(params.from, params.to);
    }

    let page = base_filter.clone().with_limit(limit).with_offset(offset);
    let events = state.audit_store().query(&page).map_err(query_failed)?;
    let total = state.audit_store().count(&base_filter).map_err(query_failed)?;

    Ok(Json(AuditQueryResponse {
        events,
        total,
        limit,
        offset,
    }))
}

/// Query parameters for an item's history
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// Maximum number of events to return (default 100, max 1000)
    pub limit: Option<i64>,
}

/// Response for the item history endpoint
#[derive(Debug, Serialize)]
pub struct ItemHistoryResponse {
    pub item_id: String,
    /// Events in the order they happened
    pub events: Vec<AuditRecord>,
}

/// Everything recorded for one item, oldest first
pub async fn item_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<ItemHistoryResponse>, (StatusCode, Json<AuditErrorResponse>)> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let events = state
        .audit_store()
        .item_history(&id, limit)
        .map_err(query_failed)?;

    Ok(Json(ItemHistoryResponse { item_id: id, events }))
}
