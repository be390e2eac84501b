use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiError, AppState};
use crate::error::GovernanceError;
use crate::locks::{LockHolder, LockKey};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub environment: String,
    pub table: String,
    pub entity_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: String,
    pub ttl_seconds: Option<u64>,
}

impl LockRequest {
    fn key(&self) -> Result<LockKey, GovernanceError> {
        for (field, value) in [
            ("environment", &self.environment),
            ("table", &self.table),
            ("entityId", &self.entity_id),
            ("userId", &self.user_id),
        ] {
            if value.trim().is_empty() {
                return Err(GovernanceError::missing_field(field));
            }
        }
        Ok(LockKey::new(&self.table, &self.entity_id, &self.environment))
    }

    fn holder(&self) -> LockHolder {
        LockHolder::new(&self.user_id, &self.user_name, &self.user_email)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryQuery {
    pub user_id: Option<String>,
}

pub async fn acquire(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = request.key()?;
    let outcome = state
        .locks
        .acquire_lock(&key, &request.holder(), request.ttl_seconds)
        .await;
    success(outcome)
}

pub async fn force_acquire(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = request.key()?;
    let taken = state
        .locks
        .force_acquire_lock(&key, &request.holder(), request.ttl_seconds)
        .await;
    success(json!({ "success": taken }))
}

pub async fn extend(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = request.key()?;
    let extended = state
        .locks
        .extend_lock(&key, &request.user_id, request.ttl_seconds)
        .await;
    success(json!({ "success": extended }))
}

pub async fn release(
    State(state): State<AppState>,
    Json(request): Json<LockRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = request.key()?;
    let released = state.locks.release_lock(&key, &request.user_id).await;
    success(json!({ "success": released }))
}

pub async fn check(
    Path((environment, table, id)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let lock = state
        .locks
        .check_lock(&LockKey::new(&table, &id, &environment))
        .await;
    success(json!({ "lock": lock }))
}

/// Lock holder and pending change request for a record about to be edited
pub async fn advisory(
    Path((environment, table, id)): Path<(String, String, String)>,
    Query(query): Query<AdvisoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let key = LockKey::new(&table, &id, &environment);
    let user_id = query.user_id.unwrap_or_default();
    let advisory = state.advisory.check_edit_session(&key, &user_id).await?;
    success(advisory)
}
