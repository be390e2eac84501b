pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::GovernanceError;

/// Approval policy for a single environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentPolicy {
    /// Number of distinct approvers needed before a change request can be applied
    #[serde(default)]
    pub required_approvers: u32,
    /// Force change requests even when no approver count is configured
    #[serde(default)]
    pub require_change_request: bool,
}

impl EnvironmentPolicy {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn with_approvers(required_approvers: u32) -> Self {
        Self {
            required_approvers,
            require_change_request: false,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.require_change_request || self.required_approvers > 0
    }

    /// A forced change request with no configured count still needs one approver
    pub fn approval_threshold(&self) -> u32 {
        self.required_approvers.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Memory,
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    pub store: LockBackend,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            store: LockBackend::Database,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub server: ServerConfig,
    pub locks: LockConfig,
    pub policy_refresh_secs: u64,
    pub event_buffer: usize,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentPolicy>,
    #[serde(default)]
    pub managed_tables: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://change-governance.db?mode=rwc".to_string(),
            server: ServerConfig::default(),
            locks: LockConfig::default(),
            policy_refresh_secs: 30,
            event_buffer: 256,
            environments: HashMap::new(),
            managed_tables: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the config file, then `GOVERNANCE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, GovernanceError> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .map_err(|e| GovernanceError::ConfigError(format!("Invalid defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("change-governance").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("GOVERNANCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GovernanceError::ConfigError(format!("Failed to load configuration: {}", e)))?;

        loader::validate(&app_config)?;
        Ok(app_config)
    }

    /// Layer policies from a separate file over the configured ones and validate the result
    pub fn merge_policies(
        &mut self,
        policies: HashMap<String, EnvironmentPolicy>,
    ) -> Result<(), GovernanceError> {
        self.environments.extend(policies);
        loader::validate(self)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
