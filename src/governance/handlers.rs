//! Per-table write handlers
//!
//! Domain collaborators own their storage. They register one handler per table and the
//! gateway and state machine dispatch pending operations to it by table name.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::types::PendingOperation;
use crate::error::GovernanceError;

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Current row for `target_id`, used as the before snapshot
    async fn load(&self, environment: &str, target_id: &str) -> Result<Option<Value>, GovernanceError>;

    /// Perform the write and return the resulting row. Must be safe to retry.
    async fn apply(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError>;

    /// Id of a row returned by `apply`, recorded so a creation can be rolled back
    fn entity_id(&self, row: &Value) -> Option<String> {
        match row.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChangeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: &str, handler: Arc<dyn ChangeHandler>) {
        self.handlers.insert(table.to_string(), handler);
    }

    pub fn with(mut self, table: &str, handler: Arc<dyn ChangeHandler>) -> Self {
        self.register(table, handler);
        self
    }

    pub fn get(&self, table: &str) -> Result<Arc<dyn ChangeHandler>, GovernanceError> {
        self.handlers
            .get(table)
            .cloned()
            .ok_or_else(|| GovernanceError::HandlerNotRegistered(table.to_string()))
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.handlers.keys().cloned().collect();
        tables.sort();
        tables
    }
}
