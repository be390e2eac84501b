//! Change Request State Machine
//!
//! draft -> open -> approved -> applied, with open -> rejected -> draft on the side.
//! Every transition is a conditional UPDATE on the current status, so a request that
//! moved underneath the caller is refused instead of being transitioned twice.

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::handlers::HandlerRegistry;
use super::policy::PolicyStore;
use super::types::{ApprovalProgress, ChangeRequestDetail, ChangeRequestMetadata, PendingOperation};
use crate::database::models::*;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::GovernanceError;
use crate::events::{EventBus, GovernanceEvent};

/// An execution claim older than this is assumed to belong to a crashed process
const STALE_EXECUTION_MINUTES: i64 = 15;

/// A change item to be captured in a new or existing draft
#[derive(Debug, Clone)]
pub struct NewChangeItem {
    pub target_table: String,
    pub target_id: Option<String>,
    pub operation: Operation,
    pub before_data: Option<Value>,
    pub after_data: Option<Value>,
}

impl NewChangeItem {
    fn into_item(self, change_request_id: &str) -> ChangeItem {
        ChangeItem {
            id: uuid::Uuid::new_v4().to_string(),
            change_request_id: change_request_id.to_string(),
            target_table: self.target_table,
            target_id: self.target_id,
            operation: self.operation,
            before_data: self.before_data,
            after_data: self.after_data,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct ChangeRequestService {
    database: Database,
    policies: PolicyStore,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
}

impl ChangeRequestService {
    pub fn new(
        database: Database,
        policies: PolicyStore,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            database,
            policies,
            handlers,
            events,
        }
    }

    /// Create a draft holding `items`
    pub async fn create_draft(
        &self,
        requester_id: &str,
        environment: &str,
        items: Vec<NewChangeItem>,
    ) -> Result<ChangeRequest, GovernanceError> {
        if requester_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("requester"));
        }
        // Unknown environments are refused before anything is stored
        self.policies.policy_for(environment).await?;

        let cr = ChangeRequest::draft(requester_id, environment);
        let mut tx = self.database.pool().begin().await?;
        Queries::insert_change_request(&mut *tx, &cr).await?;
        for item in items {
            Queries::insert_item(&mut *tx, &item.into_item(&cr.id)).await?;
        }
        Queries::insert_history(&mut *tx, &cr.id, "created", Some(requester_id), &json!({})).await?;
        tx.commit().await?;

        info!("Change request {} created by {} in {}", cr.id, requester_id, environment);
        self.events.publish(GovernanceEvent::ChangeRequestCreated {
            change_request_id: cr.id.clone(),
            environment: environment.to_string(),
            requester_id: requester_id.to_string(),
        });
        Ok(cr)
    }

    /// Put `item` in the requester's draft that already targets the same row, or in a new draft
    pub async fn capture_in_draft(
        &self,
        requester_id: &str,
        environment: &str,
        item: NewChangeItem,
    ) -> Result<ChangeRequest, GovernanceError> {
        if let Some(target_id) = item.target_id.as_deref() {
            let existing = Queries::find_draft_item(
                self.database.pool(),
                requester_id,
                environment,
                &item.target_table,
                target_id,
            )
            .await?;

            if let Some(existing) = existing {
                // The before snapshot stays the one taken when the row was first captured
                let mut tx = self.database.pool().begin().await?;
                Queries::update_item(&mut *tx, &existing.id, item.operation, &item.after_data).await?;
                Queries::touch_change_request(&mut *tx, &existing.change_request_id).await?;
                Queries::insert_history(
                    &mut *tx,
                    &existing.change_request_id,
                    "item_updated",
                    Some(requester_id),
                    &json!({ "item_id": existing.id, "operation": item.operation.as_str() }),
                )
                .await?;
                tx.commit().await?;

                info!(
                    "Updated {} {} in draft change request {}",
                    item.target_table, target_id, existing.change_request_id
                );
                return self.get_request(&existing.change_request_id).await;
            }
        }

        self.create_draft(requester_id, environment, vec![item]).await
    }

    /// The requester's draft item already targeting (table, target_id), if any
    pub async fn draft_item(
        &self,
        requester_id: &str,
        environment: &str,
        table: &str,
        target_id: &str,
    ) -> Result<Option<ChangeItem>, GovernanceError> {
        Queries::find_draft_item(self.database.pool(), requester_id, environment, table, target_id).await
    }

    pub async fn get_request(&self, id: &str) -> Result<ChangeRequest, GovernanceError> {
        Queries::get_change_request(self.database.pool(), id)
            .await?
            .ok_or_else(|| GovernanceError::change_request_not_found(id))
    }

    /// Request with its items, approvals and the approval count it needs
    pub async fn get(&self, id: &str) -> Result<ChangeRequestDetail, GovernanceError> {
        let request = self.get_request(id).await?;
        let items = Queries::list_items(self.database.pool(), id).await?;
        let approvals = Queries::list_approvals(self.database.pool(), id).await?;
        let required_approvals = self.policies.approval_threshold(&request.environment).await?;

        Ok(ChangeRequestDetail {
            request,
            items,
            approvals,
            required_approvals,
        })
    }

    pub async fn list(
        &self,
        environment: &str,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>, GovernanceError> {
        Queries::list_change_requests(self.database.pool(), environment, status).await
    }

    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>, GovernanceError> {
        Queries::list_history(self.database.pool(), id).await
    }

    pub async fn approval_progress(&self, id: &str) -> Result<ApprovalProgress, GovernanceError> {
        let cr = self.get_request(id).await?;
        let approvals = Queries::count_approvals(self.database.pool(), id).await?;
        let required = self.policies.approval_threshold(&cr.environment).await?;

        Ok(ApprovalProgress {
            status: cr.status,
            approvals,
            required,
        })
    }

    /// Edit title, description and the other descriptive fields of a draft
    pub async fn update_metadata(
        &self,
        id: &str,
        metadata: ChangeRequestMetadata,
    ) -> Result<ChangeRequest, GovernanceError> {
        let mut cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Draft {
            return Err(GovernanceError::invalid_transition(id, "edit", cr.status.as_str()));
        }

        if let Some(title) = metadata.title {
            cr.title = title;
        }
        if let Some(description) = metadata.description {
            cr.description = description;
        }
        if let Some(reason) = metadata.reason {
            cr.reason = reason;
        }
        if let Some(impact_analysis) = metadata.impact_analysis {
            cr.impact_analysis = impact_analysis;
        }
        if let Some(priority) = metadata.priority {
            cr.priority = priority;
        }
        if let Some(category) = metadata.category {
            cr.category = category;
        }

        if !Queries::update_metadata(self.database.pool(), &cr).await? {
            return self.refused(id, "edit").await;
        }
        self.get_request(id).await
    }

    /// draft -> open
    pub async fn submit(&self, id: &str, title: &str, reason: &str) -> Result<ChangeRequest, GovernanceError> {
        let title = title.trim();
        let reason = reason.trim();
        if title.is_empty() {
            return Err(GovernanceError::missing_field("title"));
        }
        if reason.is_empty() {
            return Err(GovernanceError::missing_field("reason"));
        }

        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Draft {
            return Err(GovernanceError::invalid_transition(id, "submit", cr.status.as_str()));
        }

        let mut tx = self.database.pool().begin().await?;
        if !Queries::mark_submitted(&mut *tx, id, title, reason).await? {
            tx.rollback().await?;
            return self.refused(id, "submit").await;
        }
        Queries::insert_history(&mut *tx, id, "submitted", Some(&cr.requester_id), &json!({ "title": title }))
            .await?;
        tx.commit().await?;

        info!("Change request {} submitted for approval", id);
        self.events.publish(GovernanceEvent::ChangeRequestSubmitted {
            change_request_id: id.to_string(),
            environment: cr.environment.clone(),
            requester_id: cr.requester_id.clone(),
        });
        self.get_request(id).await
    }

    /// Record one approver's sign-off; open -> approved once the threshold is reached
    pub async fn approve(
        &self,
        id: &str,
        approver_id: &str,
        comment: &str,
    ) -> Result<ApprovalProgress, GovernanceError> {
        if approver_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("approver"));
        }

        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Open {
            return Err(GovernanceError::invalid_transition(id, "approve", cr.status.as_str()));
        }
        if cr.requester_id == approver_id {
            warn!("Rejected self-approval of {} by {}", id, approver_id);
            return Err(GovernanceError::self_approval(id));
        }

        let required = self.policies.approval_threshold(&cr.environment).await?;
        let approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            change_request_id: id.to_string(),
            approver_id: approver_id.to_string(),
            comment: comment.to_string(),
            created_at: Utc::now(),
        };

        // Insert and promotion share one transaction, and the first statement is a write,
        // so concurrent approvals of the same request are serialized by the database
        let mut tx = self.database.pool().begin().await?;
        if !Queries::insert_approval(&mut *tx, &approval).await? {
            let duplicate = Queries::has_approval(&mut *tx, id, approver_id).await?;
            tx.rollback().await?;
            if duplicate {
                warn!("Duplicate approval of {} by {}", id, approver_id);
                return Err(GovernanceError::duplicate_approval(id, approver_id));
            }
            return self.refused(id, "approve").await;
        }

        let promoted = Queries::promote_if_threshold_met(&mut *tx, id, required).await?;
        let approvals = Queries::count_approvals(&mut *tx, id).await?;
        Queries::insert_history(
            &mut *tx,
            id,
            "approval_recorded",
            Some(approver_id),
            &json!({ "comment": comment, "approvals": approvals, "required": required }),
        )
        .await?;
        if promoted {
            Queries::insert_history(&mut *tx, id, "approved", Some(approver_id), &json!({})).await?;
        }
        tx.commit().await?;

        info!(
            "Change request {} approved by {} ({}/{})",
            id, approver_id, approvals, required
        );
        self.events.publish(GovernanceEvent::ApprovalRecorded {
            change_request_id: id.to_string(),
            approver_id: approver_id.to_string(),
            approvals,
            required,
        });

        let status = if promoted {
            info!("Change request {} reached its approval threshold", id);
            self.events.publish(GovernanceEvent::ChangeRequestApproved {
                change_request_id: id.to_string(),
                environment: cr.environment.clone(),
            });
            ChangeRequestStatus::Approved
        } else {
            ChangeRequestStatus::Open
        };

        Ok(ApprovalProgress {
            status,
            approvals,
            required,
        })
    }

    /// open -> rejected. Existing approvals stay for the audit trail but no longer count.
    pub async fn reject(&self, id: &str, approver_id: &str, comment: &str) -> Result<ChangeRequest, GovernanceError> {
        let comment = comment.trim();
        if comment.is_empty() {
            return Err(GovernanceError::missing_field("comment"));
        }
        if approver_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("approver"));
        }

        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Open {
            return Err(GovernanceError::invalid_transition(id, "reject", cr.status.as_str()));
        }

        let mut tx = self.database.pool().begin().await?;
        if !Queries::mark_rejected(&mut *tx, id, approver_id, comment).await? {
            tx.rollback().await?;
            return self.refused(id, "reject").await;
        }
        Queries::insert_history(&mut *tx, id, "rejected", Some(approver_id), &json!({ "comment": comment }))
            .await?;
        tx.commit().await?;

        info!("Change request {} rejected by {}", id, approver_id);
        self.events.publish(GovernanceEvent::ChangeRequestRejected {
            change_request_id: id.to_string(),
            rejected_by: approver_id.to_string(),
            reason: comment.to_string(),
        });
        self.get_request(id).await
    }

    /// rejected -> draft, discarding rejection fields and the stale approvals
    pub async fn reopen(&self, id: &str) -> Result<ChangeRequest, GovernanceError> {
        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Rejected {
            return Err(GovernanceError::invalid_transition(id, "reopen", cr.status.as_str()));
        }

        let mut tx = self.database.pool().begin().await?;
        if !Queries::mark_reopened(&mut *tx, id).await? {
            tx.rollback().await?;
            return self.refused(id, "reopen").await;
        }
        let cleared = Queries::delete_approvals(&mut *tx, id).await?;
        Queries::insert_history(
            &mut *tx,
            id,
            "reopened",
            Some(&cr.requester_id),
            &json!({ "cleared_approvals": cleared }),
        )
        .await?;
        tx.commit().await?;

        info!("Change request {} reopened, {} approvals cleared", id, cleared);
        self.events.publish(GovernanceEvent::ChangeRequestReopened {
            change_request_id: id.to_string(),
        });
        self.get_request(id).await
    }

    /// approved -> applied. Runs every captured write through its table handler.
    /// If a write fails the request stays approved and can be executed again.
    pub async fn execute(&self, id: &str, executor_id: &str) -> Result<Vec<Value>, GovernanceError> {
        if executor_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("executor"));
        }

        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Approved {
            return Err(GovernanceError::invalid_transition(id, "execute", cr.status.as_str()));
        }

        let items = Queries::list_items(self.database.pool(), id).await?;
        let operations: Vec<(ChangeItem, PendingOperation)> = items
            .into_iter()
            .map(|item| {
                let operation = PendingOperation::from_item(&item);
                (item, operation)
            })
            .collect();
        self.ensure_handlers(operations.iter().map(|(_, op)| op))?;

        self.claim(id, ChangeRequestStatus::Approved, "execute").await?;

        let mut results = Vec::with_capacity(operations.len());
        for (item, operation) in &operations {
            let applied = self.apply(&cr.environment, operation).await;
            let row = match applied {
                Ok(row) => row,
                Err(e) => {
                    error!("Execution of change request {} failed on item {}: {}", id, item.id, e);
                    Queries::release_execution_claim(self.database.pool(), id).await?;
                    return Err(e);
                }
            };

            if operation.operation == Operation::Create && item.target_id.is_none() {
                let handler = self.handlers.get(&operation.table)?;
                if let Some(target_id) = handler.entity_id(&row) {
                    Queries::set_item_target_id(self.database.pool(), &item.id, &target_id).await?;
                }
            }
            results.push(row);
        }

        let mut tx = self.database.pool().begin().await?;
        if !Queries::mark_applied(&mut *tx, id, executor_id).await? {
            tx.rollback().await?;
            return self.refused(id, "execute").await;
        }
        Queries::insert_history(
            &mut *tx,
            id,
            "applied",
            Some(executor_id),
            &json!({ "items": results.len() }),
        )
        .await?;
        tx.commit().await?;

        info!("Change request {} applied by {}", id, executor_id);
        self.events.publish(GovernanceEvent::ChangeRequestApplied {
            change_request_id: id.to_string(),
            environment: cr.environment.clone(),
            executed_by: executor_id.to_string(),
        });
        Ok(results)
    }

    /// Undo an applied request by writing the before snapshots back. Status stays applied.
    pub async fn rollback(&self, id: &str, actor_id: &str) -> Result<Vec<Value>, GovernanceError> {
        if actor_id.trim().is_empty() {
            return Err(GovernanceError::missing_field("actor"));
        }

        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Applied {
            return Err(GovernanceError::invalid_transition(id, "roll back", cr.status.as_str()));
        }
        if cr.rolled_back_at.is_some() {
            return Err(GovernanceError::StateError(format!(
                "Change request {} was already rolled back",
                id
            )));
        }

        // Undo in reverse order of application
        let items = Queries::list_items(self.database.pool(), id).await?;
        let operations = items
            .iter()
            .rev()
            .map(PendingOperation::inverse_of)
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_handlers(operations.iter())?;

        self.claim(id, ChangeRequestStatus::Applied, "roll back").await?;

        let mut results = Vec::with_capacity(operations.len());
        for operation in &operations {
            match self.apply(&cr.environment, operation).await {
                Ok(row) => results.push(row),
                Err(e) => {
                    error!("Rollback of change request {} failed: {}", id, e);
                    Queries::release_execution_claim(self.database.pool(), id).await?;
                    return Err(e);
                }
            }
        }

        let mut tx = self.database.pool().begin().await?;
        if !Queries::mark_rolled_back(&mut *tx, id, actor_id).await? {
            tx.rollback().await?;
            return self.refused(id, "roll back").await;
        }
        Queries::insert_history(
            &mut *tx,
            id,
            "rolled_back",
            Some(actor_id),
            &json!({ "items": results.len() }),
        )
        .await?;
        tx.commit().await?;

        info!("Change request {} rolled back by {}", id, actor_id);
        self.events.publish(GovernanceEvent::ChangeRequestRolledBack {
            change_request_id: id.to_string(),
            environment: cr.environment.clone(),
            rolled_back_by: actor_id.to_string(),
        });
        Ok(results)
    }

    /// Hard-delete a draft and its items
    pub async fn delete(&self, id: &str) -> Result<(), GovernanceError> {
        let cr = self.get_request(id).await?;
        if cr.status != ChangeRequestStatus::Draft {
            return Err(GovernanceError::invalid_transition(id, "delete", cr.status.as_str()));
        }

        let mut tx = self.database.pool().begin().await?;
        Queries::delete_items(&mut *tx, id).await?;
        Queries::delete_approvals(&mut *tx, id).await?;
        if !Queries::delete_draft(&mut *tx, id).await? {
            tx.rollback().await?;
            return self.refused(id, "delete").await;
        }
        Queries::insert_history(&mut *tx, id, "deleted", Some(&cr.requester_id), &json!({})).await?;
        tx.commit().await?;

        info!("Draft change request {} deleted", id);
        self.events.publish(GovernanceEvent::ChangeRequestDeleted {
            change_request_id: id.to_string(),
        });
        Ok(())
    }

    async fn apply(&self, environment: &str, operation: &PendingOperation) -> Result<Value, GovernanceError> {
        let handler = self.handlers.get(&operation.table)?;
        handler.apply(environment, operation).await
    }

    fn ensure_handlers<'a>(
        &self,
        mut operations: impl Iterator<Item = &'a PendingOperation>,
    ) -> Result<(), GovernanceError> {
        operations.try_for_each(|op| self.handlers.get(&op.table).map(|_| ()))
    }

    /// Exclusive right to run the writes of a request still in `status`
    async fn claim(&self, id: &str, status: ChangeRequestStatus, action: &str) -> Result<(), GovernanceError> {
        let stale_before = Utc::now() - Duration::minutes(STALE_EXECUTION_MINUTES);
        if Queries::claim_execution(self.database.pool(), id, status, stale_before).await? {
            return Ok(());
        }

        let current = self.get_request(id).await?;
        if current.status != status {
            return Err(GovernanceError::invalid_transition(id, action, current.status.as_str()));
        }
        if current.rolled_back_at.is_some() {
            return Err(GovernanceError::StateError(format!(
                "Change request {} was already rolled back",
                id
            )));
        }
        Err(GovernanceError::StateError(format!(
            "Change request {} is already being processed",
            id
        )))
    }

    /// Error for a conditional update that matched no row: the request changed state underneath us
    async fn refused<T>(&self, id: &str, action: &str) -> Result<T, GovernanceError> {
        let current = self.get_request(id).await?;
        Err(GovernanceError::invalid_transition(id, action, current.status.as_str()))
    }
}
