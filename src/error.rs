use thiserror::Error;

impl From<serde_json::Error> for GovernanceError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for GovernanceError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Lock store error: {0}")]
    LockStoreError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("No change handler registered for table: {0}")]
    HandlerNotRegistered(String),
}

pub type Result<T> = std::result::Result<T, GovernanceError>;

impl GovernanceError {
    pub fn unknown_environment(environment: &str) -> Self {
        Self::ConfigError(format!("Unknown environment: {}", environment))
    }

    pub fn missing_field(field: &str) -> Self {
        Self::ValidationError(format!("{} is required", field))
    }

    pub fn invalid_transition(id: &str, action: &str, status: &str) -> Self {
        Self::StateError(format!(
            "Cannot {} change request {} while it is {}",
            action, id, status
        ))
    }

    pub fn self_approval(id: &str) -> Self {
        Self::StateError(format!(
            "Requester cannot approve their own change request {}",
            id
        ))
    }

    pub fn duplicate_approval(id: &str, approver_id: &str) -> Self {
        Self::StateError(format!(
            "Approver {} already approved change request {}",
            approver_id, id
        ))
    }

    pub fn change_request_not_found(id: &str) -> Self {
        Self::NotFound(format!("Change request {}", id))
    }

    /// Policy and state errors are the caller's to fix; everything else is infrastructure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::ValidationError(_) | Self::StateError(_) | Self::NotFound(_)
        )
    }
}
