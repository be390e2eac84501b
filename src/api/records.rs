//! Gateway endpoints for managed tables

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;

use super::{success, ApiError, AppState};
use crate::error::GovernanceError;
use crate::governance::{ChangeHandler, ChangeValues, GatewayOutcome, JsonRecordHandler};

#[derive(Debug, Deserialize)]
pub struct RecordWrite {
    pub user_id: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub user_id: String,
}

fn managed<'a>(state: &'a AppState, table: &str) -> Result<&'a JsonRecordHandler, ApiError> {
    state
        .records
        .get(table)
        .ok_or_else(|| GovernanceError::HandlerNotRegistered(table.to_string()).into())
}

/// 200 for a write that already happened, 202 for one waiting on approval
fn respond(outcome: GatewayOutcome) -> Result<(StatusCode, Json<Value>), ApiError> {
    let status = if outcome.is_direct() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, success(outcome)?))
}

pub async fn list(
    Path((environment, table)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let rows = managed(&state, &table)?.list(&environment).await?;
    success(rows)
}

pub async fn get_one(
    Path((environment, table, id)): Path<(String, String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let row = managed(&state, &table)?
        .load(&environment, &id)
        .await?
        .ok_or_else(|| GovernanceError::NotFound(format!("{} {} in {}", table, id, environment)))?;
    success(row)
}

pub async fn create(
    Path((environment, table)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(request): Json<RecordWrite>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = state
        .gateway
        .request_creation(&request.user_id, &environment, &table, request.data)
        .await?;
    respond(outcome)
}

pub async fn update(
    Path((environment, table, id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    Json(request): Json<RecordWrite>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = state
        .gateway
        .process_change(
            &request.user_id,
            &environment,
            &table,
            &id,
            ChangeValues::Replace(request.data),
        )
        .await?;
    respond(outcome)
}

pub async fn delete(
    Path((environment, table, id)): Path<(String, String, String)>,
    Query(query): Query<ActorQuery>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = state
        .gateway
        .request_deletion(&query.user_id, &environment, &table, &id)
        .await?;
    respond(outcome)
}
