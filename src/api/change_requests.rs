use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiError, AppState};
use crate::database::models::ChangeRequestStatus;
use crate::error::GovernanceError;
use crate::governance::ChangeRequestMetadata;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub environment: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub approver_id: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub user_id: String,
}

pub async fn list(
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            ChangeRequestStatus::from_str(s)
                .ok_or_else(|| GovernanceError::ValidationError(format!("Unknown status: {}", s)))
        })
        .transpose()?;

    let requests = state
        .change_requests
        .list(&query.environment, status)
        .await?;
    success(requests)
}

pub async fn get_one(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    success(state.change_requests.get(&id).await?)
}

pub async fn update_metadata(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(metadata): Json<ChangeRequestMetadata>,
) -> Result<Json<Value>, ApiError> {
    success(state.change_requests.update_metadata(&id, metadata).await?)
}

pub async fn history(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    // 404 for unknown requests rather than an empty trail
    state.change_requests.get_request(&id).await?;
    success(state.change_requests.history(&id).await?)
}

pub async fn progress(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    success(state.change_requests.approval_progress(&id).await?)
}

pub async fn submit(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Value>, ApiError> {
    success(
        state
            .change_requests
            .submit(&id, &request.title, &request.reason)
            .await?,
    )
}

pub async fn approve(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<Value>, ApiError> {
    success(
        state
            .change_requests
            .approve(&id, &request.approver_id, &request.comment)
            .await?,
    )
}

pub async fn reject(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<Value>, ApiError> {
    success(
        state
            .change_requests
            .reject(&id, &request.approver_id, &request.comment)
            .await?,
    )
}

pub async fn reopen(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    success(state.change_requests.reopen(&id).await?)
}

pub async fn execute(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.change_requests.execute(&id, &request.user_id).await?;
    success(json!({ "change_request_id": id, "rows": rows }))
}

pub async fn rollback(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ActorRequest>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.change_requests.rollback(&id, &request.user_id).await?;
    success(json!({ "change_request_id": id, "rows": rows }))
}

pub async fn delete(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    state.change_requests.delete(&id).await?;
    success(json!({ "deleted": id }))
}
