//! Conflict Advisory
//!
//! Read-only signals shown before an edit session starts: who holds the soft lock and
//! whether a pending change request already targets the record. Neither blocks the edit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::GovernanceError;
use crate::locks::{EntityLock, EntityLockCoordinator, LockKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub has_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cr_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cr_title: Option<String>,
}

impl PendingChange {
    pub fn none() -> Self {
        Self {
            has_pending: false,
            cr_id: None,
            cr_title: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditAdvisory {
    pub lock: Option<EntityLock>,
    /// True when someone other than the asking user holds the lock
    pub locked_by_other: bool,
    pub pending_change: PendingChange,
}

#[derive(Clone)]
pub struct ConflictAdvisory {
    database: Database,
    locks: EntityLockCoordinator,
}

impl ConflictAdvisory {
    pub fn new(database: Database, locks: EntityLockCoordinator) -> Self {
        Self { database, locks }
    }

    /// First open or approved change request with an item on this exact record
    pub async fn check_pending_cr(&self, key: &LockKey) -> Result<PendingChange, GovernanceError> {
        let pending = Queries::find_pending_for_target(
            self.database.pool(),
            &key.environment,
            &key.table,
            &key.entity_id,
        )
        .await?;

        Ok(match pending {
            Some((id, title)) => {
                debug!("{} is targeted by pending change request {}", key, id);
                PendingChange {
                    has_pending: true,
                    cr_id: Some(id),
                    cr_title: Some(title),
                }
            }
            None => PendingChange::none(),
        })
    }

    pub async fn check_edit_session(&self, key: &LockKey, user_id: &str) -> Result<EditAdvisory, GovernanceError> {
        let lock = self.locks.check_lock(key).await;
        let pending_change = self.check_pending_cr(key).await?;
        let locked_by_other = lock.as_ref().is_some_and(|l| !l.is_held_by(user_id));

        Ok(EditAdvisory {
            lock,
            locked_by_other,
            pending_change,
        })
    }
}
