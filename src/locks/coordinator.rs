//! Entity Lock Coordinator
//!
//! Acquire, renew, take over and release soft locks. The lock store is the only source
//! of truth and ownership is decided by user id alone, so a second tab of the same user
//! simply renews the lock.
//!
//! Failure policy: acquisition and lookups fail open. When the store is unreachable the
//! caller is told the record is free, because blocking editors on a caching outage is
//! worse than an occasional missed warning. Release and extend report failure instead.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::LockStore;
use super::types::{AcquireOutcome, EntityLock, LockHolder, LockKey};
use crate::error::GovernanceError;
use crate::events::{EventBus, GovernanceEvent};

pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Longest lock a caller may ask for; longer requests are cut down to this
pub const MAX_LOCK_TTL_SECS: u64 = 24 * 60 * 60;

/// Attempts at `set_if_absent` before giving up on a key that keeps changing hands
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct EntityLockCoordinator {
    store: Arc<dyn LockStore>,
    events: EventBus,
    default_ttl_secs: u64,
}

impl EntityLockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, events: EventBus) -> Self {
        Self::with_default_ttl(store, events, DEFAULT_LOCK_TTL_SECS)
    }

    pub fn with_default_ttl(store: Arc<dyn LockStore>, events: EventBus, default_ttl_secs: u64) -> Self {
        Self {
            store,
            events,
            default_ttl_secs: if default_ttl_secs == 0 {
                DEFAULT_LOCK_TTL_SECS
            } else {
                default_ttl_secs.min(MAX_LOCK_TTL_SECS)
            },
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    fn ttl(&self, ttl_secs: Option<u64>) -> u64 {
        ttl_secs
            .filter(|t| *t > 0)
            .unwrap_or(self.default_ttl_secs)
            .min(MAX_LOCK_TTL_SECS)
    }

    /// Take the lock if it is free, renew it if the caller already holds it,
    /// otherwise report the current holder
    pub async fn acquire_lock(
        &self,
        key: &LockKey,
        holder: &LockHolder,
        ttl_secs: Option<u64>,
    ) -> AcquireOutcome {
        match self.try_acquire(key, holder, self.ttl(ttl_secs)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Fail open: an unavailable store must not stop anyone from editing
                warn!("Lock store unavailable while acquiring {}, allowing edit: {}", key, e);
                AcquireOutcome::granted(None)
            }
        }
    }

    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &LockHolder,
        ttl_secs: u64,
    ) -> Result<AcquireOutcome, GovernanceError> {
        let storage_key = key.storage_key();

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            if let Some((raw, existing)) = self.read_entry(&storage_key).await? {
                if !existing.is_held_by(&holder.user_id) {
                    debug!("Lock {} held by {}, refusing {}", key, existing.user_id, holder.user_id);
                    return Ok(AcquireOutcome::denied(existing));
                }

                let renewed = EntityLock {
                    user_name: holder.user_name.clone(),
                    user_email: holder.user_email.clone(),
                    ..existing.renewed(ttl_secs)
                };
                if self.replace(&storage_key, &raw, &renewed, ttl_secs).await? {
                    debug!("Renewed lock {} for {}", key, holder.user_id);
                    return Ok(AcquireOutcome::granted(Some(renewed)));
                }
                // Changed hands since the read; look again
                continue;
            }

            let lock = EntityLock::new(holder, ttl_secs);
            let value = serde_json::to_string(&lock)?;
            if self
                .store
                .set_if_absent(&storage_key, &value, Duration::from_secs(ttl_secs))
                .await?
            {
                info!("Lock {} acquired by {}", key, holder.user_id);
                return Ok(AcquireOutcome::granted(Some(lock)));
            }
        }

        Err(GovernanceError::LockStoreError(format!(
            "Lock {} kept changing during acquisition",
            key
        )))
    }

    /// Overwrite whatever lock exists with one for `holder`
    pub async fn force_acquire_lock(
        &self,
        key: &LockKey,
        holder: &LockHolder,
        ttl_secs: Option<u64>,
    ) -> bool {
        let ttl_secs = self.ttl(ttl_secs);
        let storage_key = key.storage_key();

        let previous = match self.read_entry(&storage_key).await {
            Ok(entry) => entry.map(|(_, lock)| lock),
            Err(e) => {
                warn!("Could not read previous holder of {}: {}", key, e);
                None
            }
        };

        let lock = match &previous {
            Some(existing) if existing.is_held_by(&holder.user_id) => existing.renewed(ttl_secs),
            _ => EntityLock::new(holder, ttl_secs),
        };

        if let Err(e) = self.write(&storage_key, &lock, ttl_secs).await {
            // Fail open like `acquire_lock`
            warn!("Lock store unavailable while forcing {}, allowing edit: {}", key, e);
            return true;
        }

        match previous {
            Some(previous) if !previous.is_held_by(&holder.user_id) => {
                info!(
                    "Lock {} taken over from {} by {}",
                    key, previous.user_id, holder.user_id
                );
                self.events.publish(GovernanceEvent::LockTakenOver {
                    key: storage_key,
                    previous: previous.holder(),
                    current: lock.holder(),
                    at: Utc::now(),
                });
            }
            _ => info!("Lock {} force-acquired by {}", key, holder.user_id),
        }

        true
    }

    /// Delete the lock if `user_id` holds it. Best effort: errors are logged and reported as `false`.
    pub async fn release_lock(&self, key: &LockKey, user_id: &str) -> bool {
        match self.try_release(key, user_id).await {
            Ok(released) => released,
            Err(e) => {
                warn!("Failed to release lock {} for {}: {}", key, user_id, e);
                false
            }
        }
    }

    async fn try_release(&self, key: &LockKey, user_id: &str) -> Result<bool, GovernanceError> {
        let storage_key = key.storage_key();
        let Some((raw, existing)) = self.read_entry(&storage_key).await? else {
            return Ok(false);
        };

        if !existing.is_held_by(user_id) {
            debug!("{} tried to release lock {} held by {}", user_id, key, existing.user_id);
            return Ok(false);
        }

        if !self.store.compare_and_delete(&storage_key, &raw).await? {
            return Ok(false);
        }

        info!("Lock {} released by {}", key, user_id);
        self.events.publish(GovernanceEvent::LockReleased {
            key: storage_key,
            user_id: user_id.to_string(),
            at: Utc::now(),
        });
        Ok(true)
    }

    /// Heartbeat. Fails when the caller no longer holds a live lock and must re-acquire.
    pub async fn extend_lock(&self, key: &LockKey, user_id: &str, ttl_secs: Option<u64>) -> bool {
        let ttl_secs = self.ttl(ttl_secs);
        let storage_key = key.storage_key();

        let result = async {
            match self.read_entry(&storage_key).await? {
                Some((raw, existing)) if existing.is_held_by(user_id) => {
                    self.replace(&storage_key, &raw, &existing.renewed(ttl_secs), ttl_secs)
                        .await
                }
                _ => Ok::<bool, GovernanceError>(false),
            }
        }
        .await;

        match result {
            Ok(extended) => {
                debug!("Extend lock {} for {}: {}", key, user_id, extended);
                extended
            }
            Err(e) => {
                warn!("Failed to extend lock {} for {}: {}", key, user_id, e);
                false
            }
        }
    }

    /// Current lock, if any. Store errors read as unlocked.
    pub async fn check_lock(&self, key: &LockKey) -> Option<EntityLock> {
        match self.read_entry(&key.storage_key()).await {
            Ok(entry) => entry.map(|(_, lock)| lock),
            Err(e) => {
                warn!("Lock store unavailable while checking {}: {}", key, e);
                None
            }
        }
    }

    async fn read_entry(&self, storage_key: &str) -> Result<Option<(String, EntityLock)>, GovernanceError> {
        let Some(raw) = self.store.get(storage_key).await? else {
            return Ok(None);
        };

        let lock: EntityLock = serde_json::from_str(&raw).map_err(|e| {
            GovernanceError::LockStoreError(format!("Corrupt lock value under {}: {}", storage_key, e))
        })?;

        // The store's own TTL is authoritative; this guards clock skew between the two
        if lock.expires_at <= Utc::now().timestamp_millis() {
            return Ok(None);
        }

        Ok(Some((raw, lock)))
    }

    /// Swap in `lock` only while the store still holds `expected`
    async fn replace(
        &self,
        storage_key: &str,
        expected: &str,
        lock: &EntityLock,
        ttl_secs: u64,
    ) -> Result<bool, GovernanceError> {
        let value = serde_json::to_string(lock)?;
        self.store
            .compare_and_set(storage_key, expected, &value, Duration::from_secs(ttl_secs))
            .await
    }

    async fn write(&self, storage_key: &str, lock: &EntityLock, ttl_secs: u64) -> Result<(), GovernanceError> {
        let value = serde_json::to_string(lock)?;
        self.store
            .set(storage_key, &value, Duration::from_secs(ttl_secs))
            .await
    }
}
