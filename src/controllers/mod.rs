pub mod events;
pub mod leases;

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use validator::Validate;

use crate::error::LeaseError;
use crate::ledger::LedgerStore;
use crate::AppState;

pub fn routes<S: LedgerStore>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .merge(events::routes())
        .merge(leases::routes())
}

/// Full application: health check, `/api` routes and request tracing.
pub fn router<S: LedgerStore>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api", routes::<S>())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

impl LeaseError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LeaseError::NotFound(_) | LeaseError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            LeaseError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LeaseError::SeatUnavailable { .. } | LeaseError::InsufficientAvailability { .. } => StatusCode::CONFLICT,
            LeaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LeaseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            LeaseError::Internal(e) => {
                error!("Request failed: {}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

impl From<JsonRejection> for LeaseError {
    fn from(rejection: JsonRejection) -> Self {
        LeaseError::invalid(rejection.body_text())
    }
}

impl From<QueryRejection> for LeaseError {
    fn from(rejection: QueryRejection) -> Self {
        LeaseError::invalid(rejection.body_text())
    }
}

impl From<PathRejection> for LeaseError {
    fn from(rejection: PathRejection) -> Self {
        LeaseError::invalid(rejection.body_text())
    }
}

fn validated<T: Validate>(value: T) -> Result<T, LeaseError> {
    value
        .validate()
        .map_err(|e| LeaseError::invalid(e.to_string()))?;
    Ok(value)
}
