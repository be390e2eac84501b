//! Environment approval policy
//!
//! Policies live in the `environment_policies` table and are cached in process. The cache
//! is reloaded once it is older than the refresh interval, so an edited policy takes
//! effect within one interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::EnvironmentPolicy;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::GovernanceError;

#[derive(Default)]
struct CachedPolicies {
    policies: HashMap<String, EnvironmentPolicy>,
    loaded_at: Option<Instant>,
}

#[derive(Clone)]
pub struct PolicyStore {
    database: Database,
    refresh_interval: Duration,
    cache: Arc<RwLock<CachedPolicies>>,
}

impl PolicyStore {
    pub fn new(database: Database, refresh_interval: Duration) -> Self {
        Self {
            database,
            refresh_interval,
            cache: Arc::new(RwLock::new(CachedPolicies::default())),
        }
    }

    /// Write configured policies to the database, replacing stored values for the same names
    pub async fn seed(&self, policies: &HashMap<String, EnvironmentPolicy>) -> Result<(), GovernanceError> {
        for (environment, policy) in policies {
            Queries::upsert_policy(self.database.pool(), environment, policy).await?;
        }
        info!("Seeded {} environment policies", policies.len());
        self.invalidate().await;
        Ok(())
    }

    pub async fn set_policy(&self, environment: &str, policy: &EnvironmentPolicy) -> Result<(), GovernanceError> {
        if environment.trim().is_empty() {
            return Err(GovernanceError::missing_field("environment"));
        }
        Queries::upsert_policy(self.database.pool(), environment, policy).await?;
        info!(
            "Policy for {} set to {} approvers (forced: {})",
            environment, policy.required_approvers, policy.require_change_request
        );
        self.invalidate().await;
        Ok(())
    }

    pub async fn invalidate(&self) {
        self.cache.write().await.loaded_at = None;
    }

    pub async fn policy_for(&self, environment: &str) -> Result<EnvironmentPolicy, GovernanceError> {
        if environment.trim().is_empty() {
            return Err(GovernanceError::ConfigError("environment is required".to_string()));
        }

        {
            let cache = self.cache.read().await;
            if cache.loaded_at.is_some_and(|t| t.elapsed() < self.refresh_interval) {
                return cache
                    .policies
                    .get(environment)
                    .cloned()
                    .ok_or_else(|| GovernanceError::unknown_environment(environment));
            }
        }

        let policies: HashMap<String, EnvironmentPolicy> =
            Queries::list_policies(self.database.pool()).await?.into_iter().collect();
        debug!("Reloaded {} environment policies", policies.len());

        let mut cache = self.cache.write().await;
        cache.policies = policies;
        cache.loaded_at = Some(Instant::now());
        cache
            .policies
            .get(environment)
            .cloned()
            .ok_or_else(|| GovernanceError::unknown_environment(environment))
    }

    pub async fn requires_approval(&self, environment: &str) -> Result<bool, GovernanceError> {
        Ok(self.policy_for(environment).await?.requires_approval())
    }

    pub async fn approval_threshold(&self, environment: &str) -> Result<u32, GovernanceError> {
        Ok(self.policy_for(environment).await?.approval_threshold())
    }
}
