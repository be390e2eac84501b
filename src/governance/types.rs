//! Gateway and state machine value types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::models::{
    Approval, ChangeItem, ChangeRequest, ChangeRequestStatus, Operation, Priority,
};
use crate::error::GovernanceError;

/// A write to perform against a domain table, stored instead of a callback so that it
/// can be executed later, possibly by another process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub table: String,
    pub operation: Operation,
    pub target_id: Option<String>,
    pub payload: Option<Value>,
}

impl PendingOperation {
    pub fn create(table: &str, payload: Value) -> Self {
        Self {
            table: table.to_string(),
            operation: Operation::Create,
            target_id: None,
            payload: Some(payload),
        }
    }

    pub fn update(table: &str, target_id: &str, values: Value) -> Self {
        Self {
            table: table.to_string(),
            operation: Operation::Update,
            target_id: Some(target_id.to_string()),
            payload: Some(values),
        }
    }

    pub fn delete(table: &str, target_id: &str) -> Self {
        Self {
            table: table.to_string(),
            operation: Operation::Delete,
            target_id: Some(target_id.to_string()),
            payload: None,
        }
    }

    /// The write captured by a change item, replayed from its stored snapshot
    pub fn from_item(item: &ChangeItem) -> Self {
        Self {
            table: item.target_table.clone(),
            operation: item.operation,
            target_id: item.target_id.clone(),
            payload: item.after_data.clone(),
        }
    }

    /// The write that undoes an applied change item
    pub fn inverse_of(item: &ChangeItem) -> Result<Self, GovernanceError> {
        match item.operation {
            Operation::Create => {
                let target_id = item.target_id.as_deref().ok_or_else(|| {
                    GovernanceError::StateError(format!(
                        "Change item {} never recorded the id of the row it created",
                        item.id
                    ))
                })?;
                Ok(Self::delete(&item.target_table, target_id))
            }
            Operation::Update | Operation::Delete => {
                let before = item.before_data.clone().ok_or_else(|| {
                    GovernanceError::ValidationError(format!(
                        "Change item {} has no before snapshot to restore",
                        item.id
                    ))
                })?;
                let target_id = item.target_id.clone();
                let operation = if item.operation == Operation::Update {
                    Operation::Update
                } else {
                    Operation::Create
                };
                Ok(Self {
                    table: item.target_table.clone(),
                    operation,
                    target_id,
                    payload: Some(before),
                })
            }
        }
    }
}

/// What the gateway did with a requested mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum GatewayOutcome {
    #[serde(rename = "DIRECT")]
    Direct { data: Value },
    #[serde(rename = "CR")]
    ChangeRequest {
        #[serde(rename = "changeRequestId")]
        change_request_id: String,
        status: ChangeRequestStatus,
    },
}

impl GatewayOutcome {
    pub fn is_direct(&self) -> bool {
        matches!(self, GatewayOutcome::Direct { .. })
    }

    pub fn change_request_id(&self) -> Option<&str> {
        match self {
            GatewayOutcome::ChangeRequest {
                change_request_id, ..
            } => Some(change_request_id),
            GatewayOutcome::Direct { .. } => None,
        }
    }
}

type ComputeFn = Box<dyn FnOnce(&Value) -> Value + Send>;

/// New values for an update: given outright, or derived from the current row
pub enum ChangeValues {
    Replace(Value),
    Compute(ComputeFn),
}

impl ChangeValues {
    pub fn compute<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        ChangeValues::Compute(Box::new(f))
    }

    /// Full after-image of the row: the new values laid over the current one
    pub fn resolve(self, current: &Value) -> Value {
        let changes = match self {
            ChangeValues::Replace(values) => values,
            ChangeValues::Compute(f) => f(current),
        };
        merge_row(current, changes)
    }
}

impl From<Value> for ChangeValues {
    fn from(values: Value) -> Self {
        ChangeValues::Replace(values)
    }
}

fn merge_row(current: &Value, changes: Value) -> Value {
    match (current, changes) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            merged.extend(changes);
            Value::Object(merged)
        }
        (_, changes) => changes,
    }
}

/// Descriptive fields editable while a request is a draft
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeRequestMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub reason: Option<String>,
    pub impact_analysis: Option<String>,
    pub priority: Option<Priority>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProgress {
    pub status: ChangeRequestStatus,
    pub approvals: u32,
    pub required: u32,
}

impl ApprovalProgress {
    pub fn is_satisfied(&self) -> bool {
        self.approvals >= self.required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequestDetail {
    #[serde(flatten)]
    pub request: ChangeRequest,
    pub items: Vec<ChangeItem>,
    pub approvals: Vec<Approval>,
    pub required_approvals: u32,
}
