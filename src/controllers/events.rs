use axum::{
    extract::{rejection::{JsonRejection, PathRejection, QueryRejection}, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use validator::Validate;

use super::validated;
use crate::error::LeaseError;
use crate::ledger::{LedgerStore, SortOrder};
use crate::models::{EventId, LeaseOwner, NewEvent, SeatState};
use crate::services::catalog::SeatListParams;
use crate::AppState;

pub fn routes<S: LedgerStore>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/events", post(create_event::<S>).get(list_events::<S>))
        .route("/events/{id}", get(get_event_details::<S>))
        .route("/events/{id}/seats", get(list_seats::<S>))
        .route("/events/{id}/reconcile", post(reconcile_event::<S>))
        .route("/events/{id}/holds", post(hold_seats::<S>))
}

/* ---------- EVENTS ---------- */

// POST /api/events
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[validate(range(min = 1))]
    pub capacity: i64,
}

async fn create_event<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<CreateEventRequest>, JsonRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Json(req) = payload?;
    let req = validated(req)?;

    let event = state
        .catalog
        .create_event(NewEvent {
            title: req.title,
            starts_at: req.starts_at,
            capacity: req.capacity,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "event": event }))))
}

// GET /api/events?page&limit
#[derive(Debug, Deserialize, Validate)]
pub struct PageQuery {
    #[validate(range(min = 1))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
}

async fn list_events<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Query(params) = query?;
    let params = validated(params)?;

    let page = state.catalog.list_events(params.page, params.limit).await?;
    Ok(Json(json!({
        "success": true,
        "events": page.items,
        "pagination": page.pagination,
    })))
}

// GET /api/events/{id}
async fn get_event_details<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<EventId>, PathRejection>,
) -> Result<Response, LeaseError> {
    let Path(event_id) = path?;

    let (details, cache_status) = match &state.cache {
        Some(cache) => match cache.get_event_details(event_id).await {
            Some(details) => (details, "HIT"),
            None => {
                let details = state.catalog.event_details(event_id).await?;
                cache.cache_event_details(&details).await;
                (details, "MISS")
            }
        },
        None => (state.catalog.event_details(event_id).await?, "MISS"),
    };

    if details.drift {
        warn!("Event {} counters drifted from its seats", event_id);
    }

    Ok((
        [("X-Cache", cache_status)],
        Json(json!({ "success": true, "details": details })),
    )
        .into_response())
}

/* ---------- SEATS ---------- */

// GET /api/events/{id}/seats?state&page&limit&order
#[derive(Debug, Deserialize, Validate)]
pub struct SeatsQuery {
    pub state: Option<SeatState>,
    #[validate(range(min = 1))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
    pub order: Option<SortOrder>,
}

async fn list_seats<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<EventId>, PathRejection>,
    query: Result<Query<SeatsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Path(event_id) = path?;
    let Query(params) = query?;
    let params = validated(params)?;

    let page = state
        .catalog
        .list_seats(
            event_id,
            SeatListParams {
                state: params.state,
                page: params.page,
                limit: params.limit,
                order: params.order,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "seats": page.items,
        "pagination": page.pagination,
    })))
}

// POST /api/events/{id}/reconcile
async fn reconcile_event<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<EventId>, PathRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Path(event_id) = path?;

    let report = state.leases.reconcile(event_id).await?;
    state.invalidate_event(event_id).await;

    Ok(Json(json!({ "success": true, "report": report })))
}

/* ---------- HOLDS ---------- */

// POST /api/events/{id}/holds
#[derive(Debug, Deserialize, Validate)]
pub struct HoldRequest {
    #[validate(length(min = 1))]
    pub labels: Vec<String>,
}

async fn hold_seats<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<EventId>, PathRejection>,
    payload: Result<Json<HoldRequest>, JsonRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Path(event_id) = path?;
    let Json(req) = payload?;
    let req = validated(req)?;

    // The owner token is minted here; clients never choose it.
    let owner = LeaseOwner::generate();
    let receipt = state.leases.hold_default(event_id, &req.labels, owner).await?;
    state.invalidate_event(event_id).await;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "lease": receipt }))))
}
