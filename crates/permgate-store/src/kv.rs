//! Key-value configuration store

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use permgate_common::error::{Error, Result};
use permgate_common::types::PermissionConfig;

use crate::ConfigStore;

/// Minimal string key-value client the store is built on
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Configuration stored as JSON documents under `<prefix><object>`
pub struct KeyValueStore {
    client: Arc<dyn KeyValueClient>,
    prefix: String,
    /// Read-through cache, dropped on reload
    cache: DashMap<String, PermissionConfig>,
}

impl KeyValueStore {
    pub fn new(client: Arc<dyn KeyValueClient>, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            cache: DashMap::new(),
        }
    }

    fn key(&self, object: &str) -> String {
        format!("{}{}", self.prefix, object)
    }
}

#[async_trait]
impl ConfigStore for KeyValueStore {
    async fn load(&self, object: &str) -> Result<Option<PermissionConfig>> {
        if let Some(config) = self.cache.get(object) {
            return Ok(Some(config.clone()));
        }

        let Some(raw) = self.client.get(&self.key(object)).await? else {
            return Ok(None);
        };
        let config: PermissionConfig = serde_json::from_str(&raw)?;
        self.cache.insert(object.to_string(), config.clone());
        Ok(Some(config))
    }

    async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>> {
        let mut configs = HashMap::new();
        for (key, raw) in self.client.scan_prefix(&self.prefix).await? {
            match serde_json::from_str::<PermissionConfig>(&raw) {
                Ok(config) => {
                    self.cache.insert(config.object.clone(), config.clone());
                    configs.insert(config.object.clone(), config);
                }
                Err(e) => warn!("Skipping unreadable permission document {}: {}", key, e),
            }
        }
        debug!("Loaded {} permission documents", configs.len());
        Ok(configs)
    }

    async fn reload(&self) -> Result<()> {
        self.cache.clear();
        Ok(())
    }

    async fn save(&self, config: PermissionConfig) -> Result<()> {
        let raw = serde_json::to_string(&config)?;
        self.client.set(&self.key(&config.object), &raw).await?;
        self.cache.insert(config.object.clone(), config);
        Ok(())
    }

    async fn remove(&self, object: &str) -> Result<()> {
        self.client.delete(&self.key(object)).await?;
        self.cache.remove(object);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "key_value"
    }
}

/// Embedded key-value client backed by a sled database
pub struct SledClient {
    db: sled::Db,
}

impl SledClient {
    /// Open (or create) a database at `path`
    ///
    /// # Errors
    /// Returns `Error::Storage` if sled cannot open the path.
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening permission database at {}", path.display());
        let db = sled::open(path).map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Throwaway database removed on drop
    ///
    /// # Errors
    /// Returns `Error::Storage` if sled cannot create the database.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Ok(Self { db })
    }
}

fn storage_err(e: sled::Error) -> Error {
    Error::Storage(e.to_string())
}

fn decode(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Storage(e.to_string()))
}

#[async_trait]
impl KeyValueClient for SledClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .get(key)
            .map_err(storage_err)?
            .map(|value| decode(&value))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key, value.as_bytes()).map_err(storage_err)?;
        self.db.flush_async().await.map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key).map_err(storage_err)?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.db
            .scan_prefix(prefix)
            .map(|entry| {
                let (key, value) = entry.map_err(storage_err)?;
                Ok((decode(&key)?, decode(&value)?))
            })
            .collect()
    }
}
