//! SQL for the change record store
//!
//! Every function takes any SQLite executor so the state machine can run the same
//! statements against the pool or inside a transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::config::EnvironmentPolicy;
use crate::database::models::*;
use crate::error::GovernanceError;

const CHANGE_REQUEST_COLUMNS: &str = "id, requester_id, environment, status, title, description, \
     reason, impact_analysis, priority, category, rejected_by, rejected_at, rejection_reason, \
     executed_by, executed_at, rolled_back_by, rolled_back_at, created_at, updated_at";

const CHANGE_ITEM_COLUMNS: &str =
    "id, change_request_id, target_table, target_id, operation, before_data, after_data, created_at";

pub struct Queries;

impl Queries {
    pub async fn insert_change_request<'e, E>(
        executor: E,
        cr: &ChangeRequest,
    ) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO change_requests
            (id, requester_id, environment, status, title, description, reason,
             impact_analysis, priority, category, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cr.id)
        .bind(&cr.requester_id)
        .bind(&cr.environment)
        .bind(cr.status.as_str())
        .bind(&cr.title)
        .bind(&cr.description)
        .bind(&cr.reason)
        .bind(&cr.impact_analysis)
        .bind(cr.priority.as_str())
        .bind(&cr.category)
        .bind(format_timestamp(cr.created_at))
        .bind(format_timestamp(cr.updated_at))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn get_change_request<'e, E>(
        executor: E,
        id: &str,
    ) -> Result<Option<ChangeRequest>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT {} FROM change_requests WHERE id = ?", CHANGE_REQUEST_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;

        row.as_ref().map(change_request_from_row).transpose()
    }

    pub async fn list_change_requests<'e, E>(
        executor: E,
        environment: &str,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM change_requests WHERE environment = ? AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC",
            CHANGE_REQUEST_COLUMNS
        );
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&sql)
            .bind(environment)
            .bind(status)
            .bind(status)
            .fetch_all(executor)
            .await?;

        rows.iter().map(change_request_from_row).collect()
    }

    /// Overwrite the descriptive fields of a draft; returns false if it is no longer a draft
    pub async fn update_metadata<'e, E>(
        executor: E,
        cr: &ChangeRequest,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET title = ?, description = ?, reason = ?, impact_analysis = ?,
                priority = ?, category = ?, updated_at = ?
            WHERE id = ? AND status = 'draft'
            "#,
        )
        .bind(&cr.title)
        .bind(&cr.description)
        .bind(&cr.reason)
        .bind(&cr.impact_analysis)
        .bind(cr.priority.as_str())
        .bind(&cr.category)
        .bind(format_timestamp(Utc::now()))
        .bind(&cr.id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_submitted<'e, E>(
        executor: E,
        id: &str,
        title: &str,
        reason: &str,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = 'open', title = ?, reason = ?, updated_at = ?
            WHERE id = ? AND status = 'draft'
            "#,
        )
        .bind(title)
        .bind(reason)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record an approval only while the request is open and the approver is not the requester
    pub async fn insert_approval<'e, E>(
        executor: E,
        approval: &Approval,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO approvals (id, change_request_id, approver_id, comment, created_at)
            SELECT ?, cr.id, ?, ?, ?
            FROM change_requests cr
            WHERE cr.id = ? AND cr.status = 'open' AND cr.requester_id <> ?
            ON CONFLICT (change_request_id, approver_id) DO NOTHING
            "#,
        )
        .bind(&approval.id)
        .bind(&approval.approver_id)
        .bind(&approval.comment)
        .bind(format_timestamp(approval.created_at))
        .bind(&approval.change_request_id)
        .bind(&approval.approver_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Open -> approved in one statement once the stored approval count reaches `threshold`
    pub async fn promote_if_threshold_met<'e, E>(
        executor: E,
        id: &str,
        threshold: u32,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = 'approved', updated_at = ?
            WHERE id = ? AND status = 'open'
              AND (SELECT COUNT(*) FROM approvals WHERE change_request_id = ?) >= ?
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(id)
        .bind(i64::from(threshold))
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_rejected<'e, E>(
        executor: E,
        id: &str,
        rejected_by: &str,
        reason: &str,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = 'rejected', rejected_by = ?, rejected_at = ?, rejection_reason = ?,
                updated_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(rejected_by)
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_reopened<'e, E>(executor: E, id: &str) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = 'draft', rejected_by = NULL, rejected_at = NULL,
                rejection_reason = NULL, updated_at = ?
            WHERE id = ? AND status = 'rejected'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Claim the right to run the writes of a request in `status` that was never rolled back.
    /// A claim older than `stale_before` is treated as abandoned by a crashed executor.
    pub async fn claim_execution<'e, E>(
        executor: E,
        id: &str,
        status: ChangeRequestStatus,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET execution_started_at = ?
            WHERE id = ? AND status = ? AND rolled_back_at IS NULL
              AND (execution_started_at IS NULL OR execution_started_at < ?)
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(status.as_str())
        .bind(format_timestamp(stale_before))
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn release_execution_claim<'e, E>(executor: E, id: &str) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE change_requests SET execution_started_at = NULL WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn mark_applied<'e, E>(
        executor: E,
        id: &str,
        executed_by: &str,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = 'applied', executed_by = ?, executed_at = ?,
                execution_started_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'approved'
            "#,
        )
        .bind(executed_by)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_rolled_back<'e, E>(
        executor: E,
        id: &str,
        rolled_back_by: &str,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET rolled_back_by = ?, rolled_back_at = ?, execution_started_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'applied' AND rolled_back_at IS NULL
            "#,
        )
        .bind(rolled_back_by)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_draft<'e, E>(executor: E, id: &str) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM change_requests WHERE id = ? AND status = 'draft'")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_items<'e, E>(executor: E, change_request_id: &str) -> Result<u64, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM change_items WHERE change_request_id = ?")
            .bind(change_request_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_item<'e, E>(executor: E, item: &ChangeItem) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO change_items
            (id, change_request_id, target_table, target_id, operation, before_data, after_data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.change_request_id)
        .bind(&item.target_table)
        .bind(&item.target_id)
        .bind(item.operation.as_str())
        .bind(json_text(&item.before_data)?)
        .bind(json_text(&item.after_data)?)
        .bind(format_timestamp(item.created_at))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn list_items<'e, E>(
        executor: E,
        change_request_id: &str,
    ) -> Result<Vec<ChangeItem>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM change_items WHERE change_request_id = ? ORDER BY created_at, rowid",
            CHANGE_ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(change_request_id)
            .fetch_all(executor)
            .await?;

        rows.iter().map(change_item_from_row).collect()
    }

    /// The requester's draft item already targeting this row, if any
    pub async fn find_draft_item<'e, E>(
        executor: E,
        requester_id: &str,
        environment: &str,
        table: &str,
        target_id: &str,
    ) -> Result<Option<ChangeItem>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM change_items ci WHERE ci.target_table = ? AND ci.target_id = ? \
             AND ci.change_request_id IN (SELECT id FROM change_requests \
             WHERE requester_id = ? AND environment = ? AND status = 'draft') \
             ORDER BY ci.created_at LIMIT 1",
            CHANGE_ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("ci.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(table)
            .bind(target_id)
            .bind(requester_id)
            .bind(environment)
            .fetch_optional(executor)
            .await?;

        row.as_ref().map(change_item_from_row).transpose()
    }

    pub async fn update_item<'e, E>(
        executor: E,
        item_id: &str,
        operation: Operation,
        after_data: &Option<Value>,
    ) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE change_items SET operation = ?, after_data = ? WHERE id = ?")
            .bind(operation.as_str())
            .bind(json_text(after_data)?)
            .bind(item_id)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn set_item_target_id<'e, E>(
        executor: E,
        item_id: &str,
        target_id: &str,
    ) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE change_items SET target_id = ? WHERE id = ?")
            .bind(target_id)
            .bind(item_id)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn touch_change_request<'e, E>(executor: E, id: &str) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE change_requests SET updated_at = ? WHERE id = ?")
            .bind(format_timestamp(Utc::now()))
            .bind(id)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn list_approvals<'e, E>(
        executor: E,
        change_request_id: &str,
    ) -> Result<Vec<Approval>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, change_request_id, approver_id, comment, created_at
            FROM approvals
            WHERE change_request_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(change_request_id)
        .fetch_all(executor)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Approval {
                    id: row.get::<String, _>("id"),
                    change_request_id: row.get::<String, _>("change_request_id"),
                    approver_id: row.get::<String, _>("approver_id"),
                    comment: row.get::<String, _>("comment"),
                    created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }

    pub async fn has_approval<'e, E>(
        executor: E,
        change_request_id: &str,
        approver_id: &str,
    ) -> Result<bool, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query("SELECT 1 FROM approvals WHERE change_request_id = ? AND approver_id = ?")
            .bind(change_request_id)
            .bind(approver_id)
            .fetch_optional(executor)
            .await?;

        Ok(row.is_some())
    }

    pub async fn count_approvals<'e, E>(executor: E, change_request_id: &str) -> Result<u32, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM approvals WHERE change_request_id = ?")
            .bind(change_request_id)
            .fetch_one(executor)
            .await?;

        Ok(row.get::<i64, _>("count") as u32)
    }

    pub async fn delete_approvals<'e, E>(executor: E, change_request_id: &str) -> Result<u64, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM approvals WHERE change_request_id = ?")
            .bind(change_request_id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_history<'e, E>(
        executor: E,
        change_request_id: &str,
        action: &str,
        actor_id: Option<&str>,
        details: &Value,
    ) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO change_request_history (change_request_id, action, actor_id, details, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(change_request_id)
        .bind(action)
        .bind(actor_id)
        .bind(serde_json::to_string(details)?)
        .bind(format_timestamp(Utc::now()))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn list_history<'e, E>(
        executor: E,
        change_request_id: &str,
    ) -> Result<Vec<HistoryEntry>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            r#"
            SELECT id, change_request_id, action, actor_id, details, created_at
            FROM change_request_history
            WHERE change_request_id = ?
            ORDER BY id
            "#,
        )
        .bind(change_request_id)
        .fetch_all(executor)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HistoryEntry {
                    id: row.get::<i64, _>("id"),
                    change_request_id: row.get::<String, _>("change_request_id"),
                    action: row.get::<String, _>("action"),
                    actor_id: row.get::<Option<String>, _>("actor_id"),
                    details: serde_json::from_str(&row.get::<String, _>("details"))?,
                    created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }

    /// First open or approved request in `environment` with an item on (table, target_id)
    pub async fn find_pending_for_target<'e, E>(
        executor: E,
        environment: &str,
        table: &str,
        target_id: &str,
    ) -> Result<Option<(String, String)>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT cr.id, cr.title
            FROM change_items ci
            JOIN change_requests cr ON ci.change_request_id = cr.id
            WHERE ci.target_table = ? AND ci.target_id = ?
              AND cr.environment = ? AND cr.status IN ('open', 'approved')
            ORDER BY cr.created_at
            LIMIT 1
            "#,
        )
        .bind(table)
        .bind(target_id)
        .bind(environment)
        .fetch_optional(executor)
        .await?;

        Ok(row.map(|r| (r.get::<String, _>("id"), r.get::<String, _>("title"))))
    }

    pub async fn upsert_policy<'e, E>(
        executor: E,
        environment: &str,
        policy: &EnvironmentPolicy,
    ) -> Result<(), GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO environment_policies (environment, required_approvers, require_change_request, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (environment) DO UPDATE SET
                required_approvers = excluded.required_approvers,
                require_change_request = excluded.require_change_request,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(environment)
        .bind(i64::from(policy.required_approvers))
        .bind(policy.require_change_request)
        .bind(format_timestamp(Utc::now()))
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn list_policies<'e, E>(
        executor: E,
    ) -> Result<Vec<(String, EnvironmentPolicy)>, GovernanceError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            "SELECT environment, required_approvers, require_change_request FROM environment_policies",
        )
        .fetch_all(executor)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("environment"),
                    EnvironmentPolicy {
                        required_approvers: row.get::<i64, _>("required_approvers").max(0) as u32,
                        require_change_request: row.get::<bool, _>("require_change_request"),
                    },
                )
            })
            .collect())
    }
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, GovernanceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GovernanceError::DatabaseError(format!("Invalid timestamp {}: {}", value, e)))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, GovernanceError> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn parse_json(value: Option<String>) -> Result<Option<Value>, GovernanceError> {
    value
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(GovernanceError::from)
}

fn json_text(value: &Option<Value>) -> Result<Option<String>, GovernanceError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(GovernanceError::from)
}

fn change_request_from_row(row: &SqliteRow) -> Result<ChangeRequest, GovernanceError> {
    let status = ChangeRequestStatus::from_str(&row.get::<String, _>("status")).ok_or_else(|| {
        GovernanceError::DatabaseError(format!(
            "Invalid change request status: {}",
            row.get::<String, _>("status")
        ))
    })?;

    let priority = Priority::from_str(&row.get::<String, _>("priority")).ok_or_else(|| {
        GovernanceError::DatabaseError(format!(
            "Invalid priority: {}",
            row.get::<String, _>("priority")
        ))
    })?;

    Ok(ChangeRequest {
        id: row.get::<String, _>("id"),
        requester_id: row.get::<String, _>("requester_id"),
        environment: row.get::<String, _>("environment"),
        status,
        title: row.get::<String, _>("title"),
        description: row.get::<String, _>("description"),
        reason: row.get::<String, _>("reason"),
        impact_analysis: row.get::<String, _>("impact_analysis"),
        priority,
        category: row.get::<String, _>("category"),
        rejected_by: row.get::<Option<String>, _>("rejected_by"),
        rejected_at: parse_optional_timestamp(row.get::<Option<String>, _>("rejected_at"))?,
        rejection_reason: row.get::<Option<String>, _>("rejection_reason"),
        executed_by: row.get::<Option<String>, _>("executed_by"),
        executed_at: parse_optional_timestamp(row.get::<Option<String>, _>("executed_at"))?,
        rolled_back_by: row.get::<Option<String>, _>("rolled_back_by"),
        rolled_back_at: parse_optional_timestamp(row.get::<Option<String>, _>("rolled_back_at"))?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn change_item_from_row(row: &SqliteRow) -> Result<ChangeItem, GovernanceError> {
    let operation = Operation::from_str(&row.get::<String, _>("operation")).ok_or_else(|| {
        GovernanceError::DatabaseError(format!(
            "Invalid operation: {}",
            row.get::<String, _>("operation")
        ))
    })?;

    Ok(ChangeItem {
        id: row.get::<String, _>("id"),
        change_request_id: row.get::<String, _>("change_request_id"),
        target_table: row.get::<String, _>("target_table"),
        target_id: row.get::<Option<String>, _>("target_id"),
        operation,
        before_data: parse_json(row.get::<Option<String>, _>("before_data"))?,
        after_data: parse_json(row.get::<Option<String>, _>("after_data"))?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}
