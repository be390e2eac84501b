use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestStatus {
    Draft,
    Open,
    Approved,
    Applied,
    Rejected,
}

impl ChangeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestStatus::Draft => "draft",
            ChangeRequestStatus::Open => "open",
            ChangeRequestStatus::Approved => "approved",
            ChangeRequestStatus::Applied => "applied",
            ChangeRequestStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ChangeRequestStatus::Draft),
            "open" => Some(ChangeRequestStatus::Open),
            "approved" => Some(ChangeRequestStatus::Approved),
            "applied" => Some(ChangeRequestStatus::Applied),
            "rejected" => Some(ChangeRequestStatus::Rejected),
            _ => None,
        }
    }

    /// Open and approved requests still intend to change their targets
    pub fn is_pending(&self) -> bool {
        matches!(self, ChangeRequestStatus::Open | ChangeRequestStatus::Approved)
    }
}

impl std::fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Kind of mutation captured by a change item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub requester_id: String,
    pub environment: String,
    pub status: ChangeRequestStatus,
    pub title: String,
    pub description: String,
    pub reason: String,
    pub impact_analysis: String,
    pub priority: Priority,
    pub category: String,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub executed_by: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub rolled_back_by: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeRequest {
    /// A fresh draft owned by `requester_id`
    pub fn draft(requester_id: &str, environment: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester_id: requester_id.to_string(),
            environment: environment.to_string(),
            status: ChangeRequestStatus::Draft,
            title: String::new(),
            description: String::new(),
            reason: String::new(),
            impact_analysis: String::new(),
            priority: Priority::default(),
            category: String::new(),
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            executed_by: None,
            executed_at: None,
            rolled_back_by: None,
            rolled_back_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeItem {
    pub id: String,
    pub change_request_id: String,
    pub target_table: String,
    pub target_id: Option<String>,
    pub operation: Operation,
    pub before_data: Option<Value>,
    pub after_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub change_request_id: String,
    pub approver_id: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the change request audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub change_request_id: String,
    pub action: String,
    pub actor_id: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}
