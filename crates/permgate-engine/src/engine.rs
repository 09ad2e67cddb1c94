//! Permission engine facade

use std::sync::Arc;

use tracing::{info, warn};

use permgate_common::config::EngineConfig;
use permgate_common::error::{Error, Result};
use permgate_common::types::{Operation, PermissionCheckResult, PermissionConfig, SecurityContext};
use permgate_store::{create_store, ConfigStore, StorageBackends};

use crate::audit::{AuditEntry, AuditLog};
use crate::cache::CacheStats;
use crate::guard::PermissionGuard;
use crate::loader::PermissionLoader;
use crate::masker::FieldMasker;
use crate::trimmer::QueryTrimmer;

/// Owns the store, loader, guard, trimmer, masker and audit log
pub struct PermissionEngine {
    pub(crate) config: EngineConfig,
    store: Arc<dyn ConfigStore>,
    loader: Arc<PermissionLoader>,
    pub(crate) guard: PermissionGuard,
    pub(crate) trimmer: QueryTrimmer,
    pub(crate) masker: FieldMasker,
    audit: Option<AuditLog>,
}

impl PermissionEngine {
    /// Build an engine from configuration and the clients its store needs.
    ///
    /// Configurations listed in `config.permissions` are written to the store
    /// first; failures there are logged and skipped.
    ///
    /// # Errors
    /// Returns `Error::Config` for invalid settings or a missing backend.
    pub async fn new(config: EngineConfig, backends: StorageBackends) -> Result<Self> {
        config.validate()?;
        let store = create_store(&config.storage, &backends)?;

        for seed in &config.permissions {
            if let Err(e) = store.save(seed.clone()).await {
                warn!("Failed to seed permissions for {}: {}", seed.object, e);
            }
        }

        Self::with_store(config, store).await
    }

    /// Build an engine over an existing store
    ///
    /// # Errors
    /// Returns `Error::Config` for invalid settings.
    pub async fn with_store(config: EngineConfig, store: Arc<dyn ConfigStore>) -> Result<Self> {
        config.validate()?;

        let loader = Arc::new(PermissionLoader::new(store.clone(), config.precompile_rules));
        if config.precompile_rules {
            match loader.load_all().await {
                Ok(configs) => info!("Pre-compiled permission rules for {} objects", configs.len()),
                Err(e) => warn!("Failed to pre-load permission rules: {}", e),
            }
        }

        let cache_ttl = config.enable_cache.then(|| config.cache_ttl());
        let audit = config.enable_audit.then(|| AuditLog::new(config.audit_capacity));

        info!(
            "Permission engine ready (store: {}, cache: {}, audit: {})",
            store.kind(),
            config.enable_cache,
            config.enable_audit
        );

        Ok(Self {
            guard: PermissionGuard::new(loader.clone(), cache_ttl),
            trimmer: QueryTrimmer::new(loader.clone()),
            masker: FieldMasker::new(loader.clone()),
            config,
            store,
            loader,
            audit,
        })
    }

    /// Whether the engine skips `object` entirely
    pub(crate) fn bypasses(&self, object: &str) -> bool {
        !self.config.enabled || self.config.is_exempt(object)
    }

    /// Decide a security context; disabled engines and exempt objects are granted
    pub async fn check_permission(&self, ctx: &SecurityContext) -> PermissionCheckResult {
        if !self.config.enabled {
            return PermissionCheckResult::grant("permission engine disabled");
        }
        if self.config.is_exempt(&ctx.object_name) {
            return PermissionCheckResult::grant("object is exempt from permission checks");
        }

        let result = self.guard.check_permission(ctx).await;
        if let Some(audit) = &self.audit {
            audit.record(ctx, &result);
        }
        result
    }

    /// Like [`PermissionEngine::check_permission`] but a denial is an error
    ///
    /// # Errors
    /// `Error::PermissionDenied` carrying the decision's reason and rule.
    pub async fn enforce(&self, ctx: &SecurityContext) -> Result<PermissionCheckResult> {
        let result = self.check_permission(ctx).await;
        if result.granted {
            Ok(result)
        } else {
            Err(denial(ctx, &result))
        }
    }

    /// Object-level check for `operation`
    pub async fn check_object_permission(
        &self,
        ctx: &SecurityContext,
        operation: Operation,
    ) -> PermissionCheckResult {
        let mut ctx = ctx.clone();
        ctx.operation = operation;
        ctx.field = None;
        self.check_permission(&ctx).await
    }

    /// Field-level check for `field` under `operation`
    pub async fn check_field_permission(
        &self,
        ctx: &SecurityContext,
        field: &str,
        operation: Operation,
    ) -> PermissionCheckResult {
        let mut ctx = ctx.clone();
        ctx.operation = operation;
        ctx.field = Some(field.to_string());
        self.check_permission(&ctx).await
    }

    /// Reload configuration from the store and drop cached decisions
    ///
    /// # Errors
    /// Propagates store failures; the compiled rules are cleared in that case.
    pub async fn reload(&self) -> Result<()> {
        let result = self.loader.reload().await;
        self.guard.clear_cache();
        result
    }

    /// Store a configuration and drop decisions cached for its object
    ///
    /// # Errors
    /// `Error::Unsupported` for read-only stores; store failures otherwise.
    pub async fn save_config(&self, config: PermissionConfig) -> Result<()> {
        let object = config.object.clone();
        self.store.save(config).await?;
        self.loader.load(&object).await?;
        self.guard.invalidate_object(&object);
        info!("Updated permissions for {}", object);
        Ok(())
    }

    /// Delete an object's configuration
    ///
    /// # Errors
    /// `Error::Unsupported` for read-only stores; store failures otherwise.
    pub async fn remove_config(&self, object: &str) -> Result<()> {
        self.store.remove(object).await?;
        self.loader.load(object).await?;
        self.guard.invalidate_object(object);
        info!("Removed permissions for {}", object);
        Ok(())
    }

    /// Audit entries, oldest first; empty when auditing is off
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.as_ref().map(AuditLog::entries).unwrap_or_default()
    }

    pub fn clear_audit_log(&self) {
        if let Some(audit) = &self.audit {
            audit.clear();
        }
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.guard.cache_stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn loader(&self) -> &Arc<PermissionLoader> {
        &self.loader
    }

    pub fn guard(&self) -> &PermissionGuard {
        &self.guard
    }

    pub fn trimmer(&self) -> &QueryTrimmer {
        &self.trimmer
    }

    pub fn masker(&self) -> &FieldMasker {
        &self.masker
    }
}

pub(crate) fn denial(ctx: &SecurityContext, result: &PermissionCheckResult) -> Error {
    Error::denied(
        ctx.object_name.clone(),
        ctx.operation.as_str(),
        result.reason.clone(),
        result.rule.clone(),
    )
}
