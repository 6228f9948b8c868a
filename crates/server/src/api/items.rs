//! Item intake and inspection handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use reelflow_core::{
    item::{ParseValueError, SeasonWithEpisodes},
    AuditEvent, Candidate, Item, ItemFilter, ItemStage, MediaKind, NewItem, OrchestratorError,
    StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::AppState;

/// Maximum allowed limit for item queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for item queries
const DEFAULT_LIMIT: i64 = 100;

/// Actor recorded when a request does not name one
const DEFAULT_ACTOR: &str = "api";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting an item
#[derive(Debug, Deserialize)]
pub struct CreateItemBody {
    #[serde(flatten)]
    pub item: NewItem,
    /// Who asked for the item
    pub requested_by: Option<String>,
}

/// Query parameters for listing items
#[derive(Debug, Deserialize)]
pub struct ListItemsParams {
    /// Filter by current stage
    pub stage: Option<String>,
    /// Filter by media kind ("movie" or "series")
    pub media_kind: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Request body for resetting a failed item
#[derive(Debug, Default, Deserialize)]
pub struct ResetItemBody {
    #[serde(default)]
    pub reset_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateItemResponse {
    pub item: Item,
    /// False when the item already existed
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct ListItemsResponse {
    pub items: Vec<Item>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// An item with its season tree and candidate pool
#[derive(Debug, Serialize)]
pub struct ItemDetailResponse {
    #[serde(flatten)]
    pub item: Item,
    pub seasons: Vec<SeasonWithEpisodes>,
    pub candidates: Vec<Candidate>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ItemErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ItemErrorResponse>)>;

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ItemErrorResponse>) {
    (
        status,
        Json(ItemErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_error(e: StoreError) -> (StatusCode, Json<ItemErrorResponse>) {
    let status = match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit an item. Resubmitting a known item returns it unchanged.
pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateItemBody>,
) -> ApiResult<(StatusCode, Json<CreateItemResponse>)> {
    if body.item.title.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "title cannot be empty"));
    }

    let outcome = state.item_store().upsert_item(body.item).map_err(store_error)?;

    if !outcome.created {
        return Ok((
            StatusCode::OK,
            Json(CreateItemResponse {
                item: outcome.item,
                created: false,
            }),
        ));
    }

    let requested_by = body
        .requested_by
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    tracing::info!(
        item_id = %outcome.item.id,
        title = %outcome.item.title,
        requested_by = %requested_by,
        "Item submitted"
    );
    state.audit().try_emit(AuditEvent::ItemCreated {
        item_id: outcome.item.id.clone(),
        title: outcome.item.title.clone(),
        media_kind: outcome.item.media_kind.to_string(),
        requested_by,
    });

    Ok((
        StatusCode::CREATED,
        Json(CreateItemResponse {
            item: outcome.item,
            created: true,
        }),
    ))
}

/// List items with optional filters
pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListItemsParams>,
) -> ApiResult<Json<ListItemsResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut base_filter = ItemFilter::new();
    if let Some(ref stage) = params.stage {
        let stage: ItemStage = stage
            .parse()
            .map_err(|e: ParseValueError| error(StatusCode::BAD_REQUEST, e.to_string()))?;
        base_filter = base_filter.with_stage(stage);
    }
    if let Some(ref kind) = params.media_kind {
        let kind: MediaKind = kind
            .parse()
            .map_err(|e: ParseValueError| error(StatusCode::BAD_REQUEST, e.to_string()))?;
        base_filter = base_filter.with_media_kind(kind);
    }

    let items = state
        .item_store()
        .list_items(&base_filter.clone().with_limit(limit).with_offset(offset))
        .map_err(store_error)?;
    let total = state
        .item_store()
        .count_items(&base_filter)
        .map_err(store_error)?;

    Ok(Json(ListItemsResponse {
        items,
        total,
        limit,
        offset,
    }))
}

/// Get an item with its seasons and candidates
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ItemDetailResponse>> {
    let store = state.item_store();
    let item = match store.get_item(&id) {
        Ok(Some(item)) => item,
        Ok(None) => {
            return Err(error(
                StatusCode::NOT_FOUND,
                format!("Item not found: {}", id),
            ))
        }
        Err(e) => return Err(store_error(e)),
    };

    let seasons = store.list_seasons(&id).map_err(store_error)?;
    let candidates = store.list_candidates(&id, None).map_err(store_error)?;

    Ok(Json(ItemDetailResponse {
        item,
        seasons,
        candidates,
    }))
}

/// Clear a terminal failure so the item re-enters its stage
pub async fn reset_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResetItemBody>,
) -> ApiResult<Json<Item>> {
    let Some(orchestrator) = state.orchestrator() else {
        return Err(error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Orchestrator not available",
        ));
    };

    let actor = body.reset_by.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    match orchestrator.reset_item(&id, &actor).await {
        Ok(item) => Ok(Json(item)),
        Err(OrchestratorError::ItemNotFound(_)) => Err(error(
            StatusCode::NOT_FOUND,
            format!("Item not found: {}", id),
        )),
        Err(e @ OrchestratorError::InvalidState { .. }) => {
            Err(error(StatusCode::CONFLICT, e.to_string()))
        }
        Err(e) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
