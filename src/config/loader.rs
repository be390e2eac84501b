//! Configuration validation and policy file loading
//! Policies can also be shipped as a standalone YAML file keyed by environment name

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::{AppConfig, EnvironmentPolicy};
use crate::error::GovernanceError;

#[derive(Debug, Clone, Deserialize)]
struct PolicyFile {
    environments: HashMap<String, EnvironmentPolicy>,
}

/// Validate the loaded configuration
pub fn validate(config: &AppConfig) -> Result<(), GovernanceError> {
    if config.locks.default_ttl_secs == 0 {
        return Err(GovernanceError::ConfigError(
            "locks.default_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if config.policy_refresh_secs == 0 {
        return Err(GovernanceError::ConfigError(
            "policy_refresh_secs must be greater than zero".to_string(),
        ));
    }

    if config.event_buffer == 0 {
        return Err(GovernanceError::ConfigError(
            "event_buffer must be greater than zero".to_string(),
        ));
    }

    for name in config.environments.keys() {
        if name.trim().is_empty() {
            return Err(GovernanceError::ConfigError(
                "Environment names cannot be empty".to_string(),
            ));
        }
    }

    for table in &config.managed_tables {
        if table.trim().is_empty() {
            return Err(GovernanceError::ConfigError(
                "Managed table names cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Load environment policies from a YAML file
pub fn load_policy_file(path: &Path) -> Result<HashMap<String, EnvironmentPolicy>, GovernanceError> {
    info!("Loading environment policies from: {:?}", path);

    if !path.exists() {
        return Err(GovernanceError::ConfigError(format!(
            "Policy file not found: {:?}",
            path
        )));
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| GovernanceError::ConfigError(format!("Failed to read {:?}: {}", path, e)))?;

    let file: PolicyFile = serde_yaml::from_str(&contents)
        .map_err(|e| GovernanceError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))?;

    info!("Loaded {} environment policies", file.environments.len());
    Ok(file.environments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = AppConfig::default();
        config.locks.default_ttl_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_environment_name_rejected() {
        let mut config = AppConfig::default();
        config
            .environments
            .insert(" ".to_string(), EnvironmentPolicy::with_approvers(1));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_policy_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "environments:\n  prod:\n    required_approvers: 2\n  qa:\n    require_change_request: true\n"
        )
        .unwrap();

        let policies = load_policy_file(file.path()).unwrap();
        assert_eq!(policies["prod"].required_approvers, 2);
        assert!(policies["qa"].requires_approval());
        assert_eq!(policies["qa"].approval_threshold(), 1);
    }

    #[test]
    fn test_missing_policy_file() {
        let result = load_policy_file(Path::new("/nonexistent/policies.yml"));
        assert!(matches!(result, Err(GovernanceError::ConfigError(_))));
    }
}
