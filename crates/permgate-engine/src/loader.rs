//! Permission loader: fetches configuration and keeps compiled rules current

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use permgate_common::error::Result;
use permgate_common::types::PermissionConfig;
use permgate_store::ConfigStore;

use crate::compiler::{CompiledRules, RuleCompiler};

struct CompiledEntry {
    source: PermissionConfig,
    rules: Arc<CompiledRules>,
}

/// Loads configuration from a [`ConfigStore`] and memoizes compiled rules
pub struct PermissionLoader {
    store: Arc<dyn ConfigStore>,
    precompile: bool,
    compiled: RwLock<HashMap<String, CompiledEntry>>,
}

impl PermissionLoader {
    pub fn new(store: Arc<dyn ConfigStore>, precompile: bool) -> Self {
        Self {
            store,
            precompile,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn precompile_enabled(&self) -> bool {
        self.precompile
    }

    /// Fetch one object's configuration, recompiling when it changed
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn load(&self, object: &str) -> Result<Option<PermissionConfig>> {
        let config = self.store.load(object).await?;
        if self.precompile {
            match &config {
                Some(config) => self.compile_if_changed(config),
                None => {
                    self.compiled.write().remove(object);
                }
            }
        }
        Ok(config)
    }

    /// Fetch every configuration and replace the compiled set
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>> {
        let configs = self.store.load_all().await?;
        if self.precompile {
            let fresh = compile_all(&configs);
            *self.compiled.write() = fresh;
            debug!("Compiled rules for {} objects", configs.len());
        }
        Ok(configs)
    }

    /// Reload the store and recompile everything.
    ///
    /// The compiled set is replaced in one swap; on failure it is left empty
    /// so stale rules are never served.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn reload(&self) -> Result<()> {
        let result = async {
            self.store.reload().await?;
            if self.precompile {
                self.store.load_all().await.map(Some)
            } else {
                Ok(None)
            }
        }
        .await;

        match result {
            Ok(Some(configs)) => {
                let fresh = compile_all(&configs);
                *self.compiled.write() = fresh;
                info!("Reloaded permission rules for {} objects", configs.len());
                Ok(())
            }
            Ok(None) => {
                self.compiled.write().clear();
                info!("Reloaded permission store");
                Ok(())
            }
            Err(e) => {
                self.compiled.write().clear();
                Err(e)
            }
        }
    }

    /// Compiled rules for an object; empty when nothing is compiled
    pub fn get_compiled_rules(&self, object: &str) -> Arc<CompiledRules> {
        self.compiled
            .read()
            .get(object)
            .map_or_else(|| Arc::new(CompiledRules::default()), |entry| entry.rules.clone())
    }

    /// Objects that currently have compiled rules, sorted
    pub fn compiled_objects(&self) -> Vec<String> {
        let mut objects: Vec<String> = self.compiled.read().keys().cloned().collect();
        objects.sort();
        objects
    }

    fn compile_if_changed(&self, config: &PermissionConfig) {
        if self
            .compiled
            .read()
            .get(&config.object)
            .is_some_and(|entry| entry.source == *config)
        {
            return;
        }
        let entry = CompiledEntry {
            source: config.clone(),
            rules: Arc::new(RuleCompiler::compile(config)),
        };
        self.compiled.write().insert(config.object.clone(), entry);
        debug!("Compiled permission rules for {}", config.object);
    }
}

fn compile_all(configs: &HashMap<String, PermissionConfig>) -> HashMap<String, CompiledEntry> {
    configs
        .iter()
        .map(|(object, config)| {
            (
                object.clone(),
                CompiledEntry {
                    source: config.clone(),
                    rules: Arc::new(RuleCompiler::compile(config)),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use permgate_common::types::{Operation, RecordRule, RecordRulePermissions};
    use permgate_store::memory::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_configs([
            PermissionConfig::new("accounts").allow(Operation::Read, &["member"]),
            PermissionConfig::new("docs").with_record_rule(RecordRule::new(
                "all",
                None,
                RecordRulePermissions::read_only(),
            )),
        ]))
    }

    #[tokio::test]
    async fn test_load_compiles() {
        let loader = PermissionLoader::new(store(), true);
        assert!(loader.get_compiled_rules("accounts").is_empty());

        let config = loader.load("accounts").await.unwrap();
        assert!(config.is_some());
        assert!(loader.get_compiled_rules("accounts").object.is_some());
        assert!(loader.load("missing").await.unwrap().is_none());
        assert!(loader.get_compiled_rules("missing").is_empty());
    }

    #[tokio::test]
    async fn test_load_reuses_unchanged_rules() {
        let loader = PermissionLoader::new(store(), true);
        loader.load("docs").await.unwrap();
        let first = loader.get_compiled_rules("docs");
        loader.load("docs").await.unwrap();
        assert!(Arc::ptr_eq(&first, &loader.get_compiled_rules("docs")));
    }

    #[tokio::test]
    async fn test_load_all_and_reload() {
        let store = store();
        let loader = PermissionLoader::new(store.clone(), true);
        let all = loader.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(loader.compiled_objects(), vec!["accounts".to_string(), "docs".to_string()]);

        store.remove("docs").await.unwrap();
        loader.reload().await.unwrap();
        assert_eq!(loader.compiled_objects(), vec!["accounts".to_string()]);
    }

    #[tokio::test]
    async fn test_no_precompile() {
        let loader = PermissionLoader::new(store(), false);
        loader.load_all().await.unwrap();
        loader.load("docs").await.unwrap();
        assert!(loader.compiled_objects().is_empty());
    }
}
