//! Unified Change Gateway
//!
//! Single entry point for domain mutations. Depending on the environment policy a write
//! either runs immediately through the table handler (DIRECT) or is captured in a draft
//! change request (CR) and only runs when that request is executed.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::handlers::{ChangeHandler, HandlerRegistry};
use super::policy::PolicyStore;
use super::state_machine::{ChangeRequestService, NewChangeItem};
use super::types::{ChangeValues, GatewayOutcome, PendingOperation};
use crate::database::models::Operation;
use crate::error::GovernanceError;

#[derive(Clone)]
pub struct ChangeGateway {
    policies: PolicyStore,
    handlers: Arc<HandlerRegistry>,
    change_requests: ChangeRequestService,
}

impl ChangeGateway {
    pub fn new(
        policies: PolicyStore,
        handlers: Arc<HandlerRegistry>,
        change_requests: ChangeRequestService,
    ) -> Self {
        Self {
            policies,
            handlers,
            change_requests,
        }
    }

    pub async fn requires_approval(&self, environment: &str) -> Result<bool, GovernanceError> {
        self.policies.requires_approval(environment).await
    }

    pub async fn request_creation(
        &self,
        user_id: &str,
        environment: &str,
        table: &str,
        payload: Value,
    ) -> Result<GatewayOutcome, GovernanceError> {
        let (handler, governed) = self.prepare(user_id, environment, table).await?;

        if !governed {
            let data = handler
                .apply(environment, &PendingOperation::create(table, payload))
                .await?;
            info!("Created {} row directly in {} for {}", table, environment, user_id);
            return Ok(GatewayOutcome::Direct { data });
        }

        let item = NewChangeItem {
            target_table: table.to_string(),
            target_id: None,
            operation: Operation::Create,
            before_data: None,
            after_data: Some(payload),
        };
        self.capture(user_id, environment, item).await
    }

    /// Update `target_id` with `values` laid over the row's current content
    pub async fn process_change(
        &self,
        user_id: &str,
        environment: &str,
        table: &str,
        target_id: &str,
        values: ChangeValues,
    ) -> Result<GatewayOutcome, GovernanceError> {
        let (handler, governed) = self.prepare(user_id, environment, table).await?;
        let before = load_existing(handler.as_ref(), environment, table, target_id).await?;

        if !governed {
            let after = values.resolve(&before);
            let data = handler
                .apply(environment, &PendingOperation::update(table, target_id, after))
                .await?;
            info!("Updated {} {} directly in {} for {}", table, target_id, environment, user_id);
            return Ok(GatewayOutcome::Direct { data });
        }

        // A second edit in the same draft builds on the first one instead of the live row
        let pending = self
            .change_requests
            .draft_item(user_id, environment, table, target_id)
            .await?
            .filter(|item| item.operation == Operation::Update)
            .and_then(|item| item.after_data);
        let after = values.resolve(pending.as_ref().unwrap_or(&before));

        let item = NewChangeItem {
            target_table: table.to_string(),
            target_id: Some(target_id.to_string()),
            operation: Operation::Update,
            before_data: Some(before),
            after_data: Some(after),
        };
        self.capture(user_id, environment, item).await
    }

    pub async fn request_deletion(
        &self,
        user_id: &str,
        environment: &str,
        table: &str,
        target_id: &str,
    ) -> Result<GatewayOutcome, GovernanceError> {
        let (handler, governed) = self.prepare(user_id, environment, table).await?;
        let before = load_existing(handler.as_ref(), environment, table, target_id).await?;

        if !governed {
            let data = handler
                .apply(environment, &PendingOperation::delete(table, target_id))
                .await?;
            info!("Deleted {} {} directly in {} for {}", table, target_id, environment, user_id);
            return Ok(GatewayOutcome::Direct { data });
        }

        let item = NewChangeItem {
            target_table: table.to_string(),
            target_id: Some(target_id.to_string()),
            operation: Operation::Delete,
            before_data: Some(before),
            after_data: None,
        };
        self.capture(user_id, environment, item).await
    }

    /// Common checks. Returns the table handler and whether the environment is governed.
    async fn prepare(
        &self,
        user_id: &str,
        environment: &str,
        table: &str,
    ) -> Result<(Arc<dyn ChangeHandler>, bool), GovernanceError> {
        if user_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("user"));
        }
        let governed = self.policies.requires_approval(environment).await?;
        let handler = self.handlers.get(table)?;
        debug!(
            "Gateway write on {} in {}: {}",
            table,
            environment,
            if governed { "change request" } else { "direct" }
        );
        Ok((handler, governed))
    }

    async fn capture(
        &self,
        user_id: &str,
        environment: &str,
        item: NewChangeItem,
    ) -> Result<GatewayOutcome, GovernanceError> {
        let cr = self
            .change_requests
            .capture_in_draft(user_id, environment, item)
            .await?;
        Ok(GatewayOutcome::ChangeRequest {
            change_request_id: cr.id,
            status: cr.status,
        })
    }
}

async fn load_existing(
    handler: &dyn ChangeHandler,
    environment: &str,
    table: &str,
    target_id: &str,
) -> Result<Value, GovernanceError> {
    if target_id.trim().is_empty() {
        return Err(GovernanceError::missing_field("target id"));
    }
    handler
        .load(environment, target_id)
        .await?
        .ok_or_else(|| GovernanceError::NotFound(format!("{} {} in {}", table, target_id, environment)))
}
