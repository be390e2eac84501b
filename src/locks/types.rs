//! Lock key, holder and lock value types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::events::HolderIdentity;

/// Identifies the record a soft lock applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub environment: String,
    pub table: String,
    pub entity_id: String,
}

impl LockKey {
    pub fn new(table: &str, entity_id: &str, environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            table: table.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    /// Key used in the lock store: `<environment>:<table>:<entityId>`
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.environment, self.table, self.entity_id)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// The user asking for a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
}

impl LockHolder {
    pub fn new(user_id: &str, user_name: &str, user_email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            user_email: user_email.to_string(),
        }
    }
}

/// Value stored under a lock key. Times are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLock {
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub locked_at: i64,
    pub expires_at: i64,
}

impl EntityLock {
    pub fn new(holder: &LockHolder, ttl_secs: u64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            user_id: holder.user_id.clone(),
            user_name: holder.user_name.clone(),
            user_email: holder.user_email.clone(),
            locked_at: now,
            expires_at: now + ttl_millis(ttl_secs),
        }
    }

    /// Same lock with a fresh expiry; `locked_at` is kept
    pub fn renewed(&self, ttl_secs: u64) -> Self {
        Self {
            expires_at: Utc::now().timestamp_millis() + ttl_millis(ttl_secs),
            ..self.clone()
        }
    }

    pub fn is_held_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn holder(&self) -> HolderIdentity {
        HolderIdentity {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_email: self.user_email.clone(),
        }
    }
}

fn ttl_millis(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX / 2)
}

/// Result of `acquire_lock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireOutcome {
    pub success: bool,
    /// Lock now held by the caller, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<EntityLock>,
    /// Lock held by someone else when the acquisition was refused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_lock: Option<EntityLock>,
}

impl AcquireOutcome {
    pub fn granted(lock: Option<EntityLock>) -> Self {
        Self {
            success: true,
            lock,
            existing_lock: None,
        }
    }

    pub fn denied(existing: EntityLock) -> Self {
        Self {
            success: false,
            lock: None,
            existing_lock: Some(existing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_format() {
        let key = LockKey::new("g_ip_whitelist", "42", "prod");
        assert_eq!(key.storage_key(), "prod:g_ip_whitelist:42");
        assert_eq!(key.to_string(), "prod:g_ip_whitelist:42");
    }

    #[test]
    fn test_renewal_keeps_locked_at() {
        let holder = LockHolder::new("7", "Jane", "jane@example.com");
        let lock = EntityLock::new(&holder, 60);
        let renewed = lock.renewed(300);

        assert_eq!(renewed.locked_at, lock.locked_at);
        assert!(renewed.expires_at > lock.expires_at);
        assert!(renewed.is_held_by("7"));
    }

    #[test]
    fn test_lock_value_uses_camel_case() {
        let lock = EntityLock::new(&LockHolder::new("7", "Jane", "jane@example.com"), 300);
        let json = serde_json::to_value(&lock).unwrap();
        assert_eq!(json["userId"], "7");
        assert!(json["lockedAt"].is_i64());
        assert_eq!(
            json["expiresAt"].as_i64().unwrap() - json["lockedAt"].as_i64().unwrap(),
            300_000
        );
    }
}
