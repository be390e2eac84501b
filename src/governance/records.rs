//! Generic JSON record storage
//!
//! Handler for tables that have no dedicated storage of their own. Rows are JSON objects
//! kept in `managed_records`, keyed by environment, table and id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tracing::debug;

use super::handlers::ChangeHandler;
use super::types::PendingOperation;
use crate::database::models::Operation;
use crate::database::queries::format_timestamp;
use crate::database::Database;
use crate::error::GovernanceError;

#[derive(Clone)]
pub struct JsonRecordHandler {
    database: Database,
    table: String,
}

impl JsonRecordHandler {
    pub fn new(database: Database, table: &str) -> Self {
        Self {
            database,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn list(&self, environment: &str) -> Result<Vec<Value>, GovernanceError> {
        let rows = sqlx::query(
            "SELECT data FROM managed_records WHERE environment = ? AND table_name = ? ORDER BY id",
        )
        .bind(environment)
        .bind(&self.table)
        .fetch_all(self.database.pool())
        .await?;

        rows.iter()
            .map(|row| {
                serde_json::from_str::<Value>(&row.get::<String, _>("data")).map_err(GovernanceError::from)
            })
            .collect()
    }

    async fn upsert(&self, environment: &str, id: &str, row: &Value) -> Result<(), GovernanceError> {
        sqlx::query(
            r#"
            INSERT INTO managed_records (environment, table_name, id, data, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (environment, table_name, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(environment)
        .bind(&self.table)
        .bind(id)
        .bind(serde_json::to_string(row)?)
        .bind(format_timestamp(Utc::now()))
        .execute(self.database.pool())
        .await?;

        Ok(())
    }

    /// Insert a new row. Never overwrites an existing one.
    async fn insert(&self, environment: &str, id: &str, row: &Value) -> Result<(), GovernanceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO managed_records (environment, table_name, id, data, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (environment, table_name, id) DO NOTHING
            "#,
        )
        .bind(environment)
        .bind(&self.table)
        .bind(id)
        .bind(serde_json::to_string(row)?)
        .bind(format_timestamp(Utc::now()))
        .execute(self.database.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::StateError(format!(
                "{} {} already exists in {}",
                self.table, id, environment
            )));
        }
        Ok(())
    }

    async fn create(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        let payload = object_payload(operation)?;

        // A recorded target id means this row was created by an earlier run of the same
        // write (a retried execution or a restored deletion), so it may be written again
        if let Some(id) = operation.target_id.as_deref() {
            let row = with_id(payload, id);
            self.upsert(environment, id, &row).await?;
            debug!("Restored {} {} in {}", self.table, id, environment);
            return Ok(row);
        }

        let id = self
            .entity_id(&payload)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let row = with_id(payload, &id);
        self.insert(environment, &id, &row).await?;
        debug!("Stored {} {} in {}", self.table, id, environment);
        Ok(row)
    }

    async fn update(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        let id = target_id(operation)?;
        let row = with_id(object_payload(operation)?, id);

        let result = sqlx::query(
            r#"
            UPDATE managed_records SET data = ?, updated_at = ?
            WHERE environment = ? AND table_name = ? AND id = ?
            "#,
        )
        .bind(serde_json::to_string(&row)?)
        .bind(format_timestamp(Utc::now()))
        .bind(environment)
        .bind(&self.table)
        .bind(id)
        .execute(self.database.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::NotFound(format!(
                "{} {} in {}",
                self.table, id, environment
            )));
        }
        debug!("Updated {} {} in {}", self.table, id, environment);
        Ok(row)
    }

    async fn delete(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        let id = target_id(operation)?;
        let existing = self.load(environment, id).await?;

        sqlx::query("DELETE FROM managed_records WHERE environment = ? AND table_name = ? AND id = ?")
            .bind(environment)
            .bind(&self.table)
            .bind(id)
            .execute(self.database.pool())
            .await?;

        debug!("Deleted {} {} in {}", self.table, id, environment);
        Ok(existing.unwrap_or_else(|| serde_json::json!({ "id": id })))
    }
}

#[async_trait]
impl ChangeHandler for JsonRecordHandler {
    async fn load(&self, environment: &str, target_id: &str) -> Result<Option<Value>, GovernanceError> {
        let row = sqlx::query(
            "SELECT data FROM managed_records WHERE environment = ? AND table_name = ? AND id = ?",
        )
        .bind(environment)
        .bind(&self.table)
        .bind(target_id)
        .fetch_optional(self.database.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("data"))?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        if operation.table != self.table {
            return Err(GovernanceError::ExecutionError(format!(
                "Handler for {} received an operation on {}",
                self.table, operation.table
            )));
        }

        match operation.operation {
            Operation::Create => self.create(environment, operation).await,
            Operation::Update => self.update(environment, operation).await,
            Operation::Delete => self.delete(environment, operation).await,
        }
    }
}

fn target_id(operation: &PendingOperation) -> Result<&str, GovernanceError> {
    operation
        .target_id
        .as_deref()
        .ok_or_else(|| GovernanceError::missing_field("target id"))
}

fn object_payload(operation: &PendingOperation) -> Result<Value, GovernanceError> {
    match &operation.payload {
        Some(payload @ Value::Object(_)) => Ok(payload.clone()),
        Some(_) => Err(GovernanceError::ValidationError(
            "Record payload must be a JSON object".to_string(),
        )),
        None => Err(GovernanceError::missing_field("payload")),
    }
}

fn with_id(mut row: Value, id: &str) -> Value {
    if let Value::Object(fields) = &mut row {
        fields.insert("id".to_string(), Value::String(id.to_string()));
    }
    row
}
