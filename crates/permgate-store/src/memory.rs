//! In-memory configuration store

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use permgate_common::error::Result;
use permgate_common::types::PermissionConfig;

use crate::ConfigStore;

/// Configuration held in a process-local map
#[derive(Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<String, PermissionConfig>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `configs`
    pub fn with_configs(configs: impl IntoIterator<Item = PermissionConfig>) -> Self {
        let store = Self::new();
        {
            let mut map = store.configs.write();
            for config in configs {
                map.insert(config.object.clone(), config);
            }
        }
        store
    }

    /// Number of configured objects
    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self, object: &str) -> Result<Option<PermissionConfig>> {
        Ok(self.configs.read().get(object).cloned())
    }

    async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>> {
        Ok(self.configs.read().clone())
    }

    async fn reload(&self) -> Result<()> {
        // Nothing cached outside the map itself
        Ok(())
    }

    async fn save(&self, config: PermissionConfig) -> Result<()> {
        self.configs.write().insert(config.object.clone(), config);
        Ok(())
    }

    async fn remove(&self, object: &str) -> Result<()> {
        self.configs.write().remove(object);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permgate_common::types::Operation;

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = MemoryStore::new();
        assert!(store.load("users").await.unwrap().is_none());

        store
            .save(PermissionConfig::new("users").allow(Operation::Read, &["member"]))
            .await
            .unwrap();
        let loaded = store.load("users").await.unwrap().unwrap();
        assert_eq!(loaded.roles_for(Operation::Read).unwrap(), &["member".to_string()]);

        store.remove("users").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_load_all() {
        let store = MemoryStore::with_configs(vec![
            PermissionConfig::new("a"),
            PermissionConfig::new("b"),
        ]);
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("b"));
    }
}
