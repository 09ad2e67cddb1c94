//! Permission configuration stores
//!
//! The engine reads configuration through the [`ConfigStore`] contract only.
//! Backends:
//! - [`MemoryStore`]: in-process map
//! - [`KeyValueStore`]: JSON documents behind a [`KeyValueClient`] (embedded [`SledClient`] included)
//! - [`DatabaseStore`]: rows in a table behind a [`DatabaseDriver`]
//! - custom: any `Arc<dyn ConfigStore>`

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use permgate_common::config::{StorageConfig, StorageType};
use permgate_common::error::{Error, Result};
use permgate_common::types::PermissionConfig;

pub mod database;
pub mod kv;
pub mod memory;

pub use database::{DatabaseDriver, DatabaseStore};
pub use kv::{KeyValueClient, KeyValueStore, SledClient};
pub use memory::MemoryStore;

/// Source of permission configuration, keyed by object name
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load one object's configuration
    async fn load(&self, object: &str) -> Result<Option<PermissionConfig>>;

    /// Load every configuration
    async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>>;

    /// Drop anything the backend holds locally so the next load sees fresh data
    async fn reload(&self) -> Result<()>;

    /// Persist a configuration (runtime-managed backends only)
    async fn save(&self, _config: PermissionConfig) -> Result<()> {
        Err(Error::Unsupported(format!("{} store is read-only", self.kind())))
    }

    /// Remove an object's configuration (runtime-managed backends only)
    async fn remove(&self, _object: &str) -> Result<()> {
        Err(Error::Unsupported(format!("{} store is read-only", self.kind())))
    }

    /// Backend name, for logging
    fn kind(&self) -> &'static str;
}

/// Concrete clients the non-memory backends are built from
#[derive(Default, Clone)]
pub struct StorageBackends {
    pub key_value: Option<Arc<dyn KeyValueClient>>,
    pub driver: Option<Arc<dyn DatabaseDriver>>,
    pub custom: Option<Arc<dyn ConfigStore>>,
}

impl StorageBackends {
    #[must_use]
    pub fn with_key_value(mut self, client: Arc<dyn KeyValueClient>) -> Self {
        self.key_value = Some(client);
        self
    }

    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn DatabaseDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    #[must_use]
    pub fn with_custom(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.custom = Some(store);
        self
    }
}

/// Build the store selected by `config`
///
/// # Errors
/// Returns `Error::Config` when the selected backend is missing its client,
/// driver or custom store, and `Error::Storage` when the embedded key-value
/// database cannot be opened.
pub fn create_store(
    config: &StorageConfig,
    backends: &StorageBackends,
) -> Result<Arc<dyn ConfigStore>> {
    let store: Arc<dyn ConfigStore> = match config.kind {
        StorageType::Memory => Arc::new(MemoryStore::new()),
        StorageType::KeyValue => {
            let client: Arc<dyn KeyValueClient> = match (&backends.key_value, &config.path) {
                (Some(client), _) => client.clone(),
                (None, Some(path)) => Arc::new(SledClient::open(path)?),
                (None, None) => {
                    return Err(Error::Config(
                        "key_value storage requires a client or a path".to_string(),
                    ))
                }
            };
            Arc::new(KeyValueStore::new(client, &config.key_prefix))
        }
        StorageType::Database => {
            let driver = backends.driver.clone().ok_or_else(|| {
                Error::Config("database storage requires a database driver".to_string())
            })?;
            Arc::new(DatabaseStore::new(driver, &config.table))
        }
        StorageType::Custom => backends.custom.clone().ok_or_else(|| {
            Error::Config("custom storage selected but no store was provided".to_string())
        })?,
    };

    info!("Using {} permission store", store.kind());
    Ok(store)
}
