//! Configuration types for the permgate engine

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PermissionConfig;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch; a disabled engine grants everything
    pub enabled: bool,
    /// Where permission configuration is loaded from
    pub storage: StorageConfig,
    /// Objects that skip all checks
    pub exempt_objects: Vec<String>,
    pub enable_row_level_security: bool,
    pub enable_field_level_security: bool,
    /// Compile rules whenever configuration is loaded
    pub precompile_rules: bool,
    pub enable_cache: bool,
    /// Permission cache TTL in milliseconds (must be positive)
    pub cache_ttl_ms: u64,
    /// Raise a denial error instead of marking the request as skipped
    pub throw_on_denied: bool,
    pub enable_audit: bool,
    /// Number of most recent decisions kept in the audit log
    pub audit_capacity: usize,
    /// Configurations written to the store at startup
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            exempt_objects: vec![],
            enable_row_level_security: true,
            enable_field_level_security: true,
            precompile_rules: true,
            enable_cache: true,
            cache_ttl_ms: 60_000,
            throw_on_denied: true,
            enable_audit: false,
            audit_capacity: 1000,
            permissions: vec![],
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with
    ///
    /// # Errors
    /// Returns `Error::Config` for a zero cache TTL or audit capacity.
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_ms == 0 {
            return Err(Error::Config("cache_ttl_ms must be positive".to_string()));
        }
        if self.enable_audit && self.audit_capacity == 0 {
            return Err(Error::Config("audit_capacity must be positive".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    #[must_use]
    pub fn is_exempt(&self, object: &str) -> bool {
        self.exempt_objects.iter().any(|o| o == object)
    }
}

/// Configuration-store backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    /// External key-value client (`redis` accepted for compatibility)
    #[serde(alias = "redis")]
    KeyValue,
    Database,
    Custom,
}

/// Configuration-store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageType,
    /// Key prefix for key-value backends
    pub key_prefix: String,
    /// Table for database backends
    pub table: String,
    /// On-disk location for the embedded key-value client
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageType::Memory,
            key_prefix: "permissions:".to_string(),
            table: "_permissions".to_string(),
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.enabled);
        assert!(config.throw_on_denied);
        assert!(!config.enable_audit);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.storage.kind, StorageType::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = EngineConfig {
            cache_ttl_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_config() {
        let config: EngineConfig = toml::from_str(
            r#"
            exempt_objects = ["audit_log"]
            cache_ttl_ms = 500
            throw_on_denied = false

            [storage]
            type = "redis"
            key_prefix = "perm:"
            "#,
        )
        .unwrap();

        assert!(config.is_exempt("audit_log"));
        assert_eq!(config.cache_ttl_ms, 500);
        assert!(!config.throw_on_denied);
        assert_eq!(config.storage.kind, StorageType::KeyValue);
        assert_eq!(config.storage.table, "_permissions");
    }
}
