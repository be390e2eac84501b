//! HTTP API
//!
//! Thin axum layer over the lock coordinator, advisory, change request service and
//! gateway. Actor ids travel in request bodies; authentication happens upstream.

pub mod change_requests;
pub mod locks;
pub mod records;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::advisory::ConflictAdvisory;
use crate::config::AppConfig;
use crate::error::GovernanceError;
use crate::governance::{ChangeGateway, ChangeRequestService, JsonRecordHandler};
use crate::locks::EntityLockCoordinator;

/// Services shared by every handler, constructed once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub locks: EntityLockCoordinator,
    pub advisory: ConflictAdvisory,
    pub change_requests: ChangeRequestService,
    pub gateway: ChangeGateway,
    pub records: Arc<HashMap<String, JsonRecordHandler>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .route("/locks/acquire", post(locks::acquire))
        .route("/locks/force", post(locks::force_acquire))
        .route("/locks/extend", post(locks::extend))
        .route("/locks/release", post(locks::release))
        .route("/locks/:environment/:table/:id", get(locks::check))
        .route("/advisory/:environment/:table/:id", get(locks::advisory))
        .route("/change-requests", get(change_requests::list))
        .route(
            "/change-requests/:id",
            get(change_requests::get_one)
                .patch(change_requests::update_metadata)
                .delete(change_requests::delete),
        )
        .route("/change-requests/:id/history", get(change_requests::history))
        .route("/change-requests/:id/progress", get(change_requests::progress))
        .route("/change-requests/:id/submit", post(change_requests::submit))
        .route("/change-requests/:id/approve", post(change_requests::approve))
        .route("/change-requests/:id/reject", post(change_requests::reject))
        .route("/change-requests/:id/reopen", post(change_requests::reopen))
        .route("/change-requests/:id/execute", post(change_requests::execute))
        .route("/change-requests/:id/rollback", post(change_requests::rollback))
        .route(
            "/records/:environment/:table",
            get(records::list).post(records::create),
        )
        .route(
            "/records/:environment/:table/:id",
            get(records::get_one)
                .patch(records::update)
                .delete(records::delete),
        )
        .with_state(state)
}

/// Success envelope used by every endpoint
pub(crate) fn success(data: impl serde::Serialize) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({
        "status": "success",
        "data": serde_json::to_value(data).map_err(GovernanceError::from)?,
    })))
}

/// `GovernanceError` rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub GovernanceError);

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            GovernanceError::ValidationError(_) | GovernanceError::ConfigError(_) => {
                StatusCode::BAD_REQUEST
            }
            GovernanceError::NotFound(_) | GovernanceError::HandlerNotRegistered(_) => {
                StatusCode::NOT_FOUND
            }
            GovernanceError::StateError(_) => StatusCode::CONFLICT,
            GovernanceError::DatabaseError(_)
            | GovernanceError::LockStoreError(_)
            | GovernanceError::ExecutionError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request refused: {}", self.0);
        }

        let body = Json(json!({
            "status": "error",
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "change-governance",
        "timestamp": chrono::Utc::now()
    }))
}

async fn status_endpoint(State(state): State<AppState>) -> Json<Value> {
    let mut environments: Vec<&String> = state.config.environments.keys().collect();
    environments.sort();
    let mut tables: Vec<&String> = state.records.keys().collect();
    tables.sort();

    Json(json!({
        "status": "healthy",
        "service": "change-governance",
        "timestamp": chrono::Utc::now(),
        "environments": environments,
        "managed_tables": tables,
        "locks": {
            "store": state.config.locks.store,
            "default_ttl_secs": state.locks.default_ttl_secs(),
        }
    }))
}
