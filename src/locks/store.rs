//! Lock Store
//!
//! Key-value storage with a per-key time to live. It carries no lock semantics of its
//! own; the coordinator interprets the values.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::GovernanceError;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Live value for `key`; expired entries read as absent
    async fn get(&self, key: &str) -> Result<Option<String>, GovernanceError>;

    /// Store `value` only when no live entry exists. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, GovernanceError>;

    /// Store `value` unconditionally
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GovernanceError>;

    /// Replace the entry only if it still holds a live `expected`. Returns whether it was replaced.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GovernanceError>;

    /// Remove the entry only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, GovernanceError>;
}

/// Process-local store, suitable for a single server instance and for tests
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry_instant(now: Instant, ttl: Duration) -> Result<Instant, GovernanceError> {
    now.checked_add(ttl)
        .ok_or_else(|| GovernanceError::LockStoreError(format!("TTL of {:?} is out of range", ttl)))
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GovernanceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let live = entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, GovernanceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if matches!(entries.get(key), Some((_, expires)) if *expires > now) {
            return Ok(false);
        }
        let expires = expiry_instant(now, ttl)?;
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GovernanceError> {
        let expires = expiry_instant(Instant::now(), ttl)?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GovernanceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expires = expiry_instant(now, ttl)?;
        match entries.get_mut(key) {
            Some(entry) if entry.0 == expected && entry.1 > now => {
                *entry = (value.to_string(), expires);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, GovernanceError> {
        let mut entries = self.entries.lock().await;
        let matches = matches!(
            entries.get(key),
            Some((value, expires)) if value == expected && *expires > Instant::now()
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

/// Store backed by the `entity_locks` table, shared by every process using the database
#[derive(Clone)]
pub struct SqlLockStore {
    pool: SqlitePool,
}

impl SqlLockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Drop rows whose TTL has passed. Reads already ignore them.
    pub async fn purge_expired(&self) -> Result<u64, GovernanceError> {
        let result = sqlx::query("DELETE FROM entity_locks WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        debug!("Purged {} expired entity locks", result.rows_affected());
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2))
}

fn store_error(err: sqlx::Error) -> GovernanceError {
    GovernanceError::LockStoreError(err.to_string())
}

#[async_trait]
impl LockStore for SqlLockStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GovernanceError> {
        let row = sqlx::query("SELECT value FROM entity_locks WHERE lock_key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, GovernanceError> {
        // An expired row counts as absent and is overwritten in the same statement
        let result = sqlx::query(
            r#"
            INSERT INTO entity_locks (lock_key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE entity_locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), GovernanceError> {
        sqlx::query(
            r#"
            INSERT INTO entity_locks (lock_key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_millis(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GovernanceError> {
        let result = sqlx::query(
            "UPDATE entity_locks SET value = ?, expires_at = ? WHERE lock_key = ? AND value = ? AND expires_at > ?",
        )
        .bind(value)
        .bind(expiry_millis(ttl))
        .bind(key)
        .bind(expected)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, GovernanceError> {
        let result =
            sqlx::query("DELETE FROM entity_locks WHERE lock_key = ? AND value = ? AND expires_at > ?")
                .bind(key)
                .bind(expected)
                .bind(now_millis())
                .execute(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }
}
