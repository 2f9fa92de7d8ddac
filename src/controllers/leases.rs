use axum::{
    extract::{rejection::PathRejection, Path, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::LeaseError;
use crate::ledger::LedgerStore;
use crate::models::LeaseOwner;
use crate::AppState;

pub fn routes<S: LedgerStore>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/leases/{owner}/confirm", post(confirm_lease::<S>))
        .route("/leases/{owner}/release", post(release_lease::<S>))
}

// POST /api/leases/{owner}/confirm
async fn confirm_lease<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<LeaseOwner>, PathRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Path(owner) = path?;

    let confirmation = state.leases.confirm(owner).await?;
    state.invalidate_event(confirmation.event_id).await;

    Ok(Json(json!({ "success": true, "confirmation": confirmation })))
}

// POST /api/leases/{owner}/release
async fn release_lease<S: LedgerStore>(
    State(state): State<Arc<AppState<S>>>,
    path: Result<Path<LeaseOwner>, PathRejection>,
) -> Result<impl IntoResponse, LeaseError> {
    let Path(owner) = path?;

    let released = state.leases.release(owner).await?;
    state.invalidate_event(released.event_id).await;

    Ok(Json(json!({ "success": true, "released": released })))
}
