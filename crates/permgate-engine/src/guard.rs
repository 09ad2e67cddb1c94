//! Permission guard: answers "may this user perform this operation?"

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use permgate_common::error::Result;
use permgate_common::types::{
    Operation, PermissionCheckResult, PermissionConfig, SecurityContext, UserContext,
};

use crate::cache::{CacheKey, CacheStats, PermissionCache};
use crate::compiler::CompiledRules;
use crate::loader::PermissionLoader;

/// Evaluates object, field and record permissions for a [`SecurityContext`]
pub struct PermissionGuard {
    loader: Arc<PermissionLoader>,
    cache: Option<PermissionCache>,
}

impl PermissionGuard {
    /// Guard with an optional decision cache
    pub fn new(loader: Arc<PermissionLoader>, cache_ttl: Option<Duration>) -> Self {
        Self {
            loader,
            cache: cache_ttl.map(PermissionCache::new),
        }
    }

    /// Decide whether the context's operation is permitted.
    ///
    /// Evaluation order: configuration lookup, user presence, field check,
    /// object-level roles, record rules, row-level security.
    pub async fn check_permission(&self, ctx: &SecurityContext) -> PermissionCheckResult {
        let key = self.cache.as_ref().map(|_| CacheKey::from_context(ctx));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(result) = cache.get(key) {
                debug!("Permission cache hit for {}", key);
                return result;
            }
        }

        let result = match self.evaluate(ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load permissions for {}: {}", ctx.object_name, e);
                return PermissionCheckResult::deny("permission configuration unavailable");
            }
        };
        debug!(
            "Permission {} for {} on {}: {}",
            if result.granted { "granted" } else { "denied" },
            ctx.operation,
            ctx.object_name,
            result.reason
        );

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache.insert(key, result.clone());
        }
        result
    }

    /// Object-level check for `operation`, ignoring any field on the context
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

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    pub fn invalidate_object(&self, object: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_object(object);
        }
    }

    /// Cache counters; `None` when caching is disabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(PermissionCache::stats)
    }

    /// Decide without the cache; store failures are returned so they are never cached
    async fn evaluate(&self, ctx: &SecurityContext) -> Result<PermissionCheckResult> {
        let Some(config) = self.loader.load(&ctx.object_name).await? else {
            return Ok(PermissionCheckResult::grant("no permission configuration for object"));
        };

        let Some(user) = ctx.user.as_ref() else {
            return Ok(PermissionCheckResult::deny("no user context"));
        };

        if let Some(field) = ctx.field.as_deref() {
            if !config.field_permissions.is_empty() {
                return Ok(check_field(&config, field, user, ctx.operation));
            }
        }

        let rules = self.loader.get_compiled_rules(&ctx.object_name);

        if let Some(denied) = check_object(&config, &rules, user, ctx.operation) {
            return Ok(denied);
        }

        if let Some(record) = ctx.record.as_ref() {
            if !config.record_rules.is_empty() {
                return Ok(check_record_rules(&rules, record, user, ctx.operation));
            }
        }

        if let Some(rls) = config.row_level_security.as_ref().filter(|rls| rls.enabled) {
            if rls.bypassed_by(&user.roles) {
                return Ok(PermissionCheckResult::grant("row-level security bypassed by role exception"));
            }
            return Ok(PermissionCheckResult::grant("row-level security enforced at query time"));
        }

        Ok(PermissionCheckResult::grant("no restrictions found"))
    }
}

fn check_field(
    config: &PermissionConfig,
    field: &str,
    user: &UserContext,
    operation: Operation,
) -> PermissionCheckResult {
    let roles = config
        .field_permissions
        .get(field)
        .and_then(|perm| perm.roles_for(operation));

    match roles {
        None => PermissionCheckResult::deny(format!(
            "no roles configured for {operation} on field '{field}'"
        )),
        Some(roles) if user.has_any_role(roles) => {
            PermissionCheckResult::grant(format!("field '{field}' {operation} permitted"))
        }
        Some(_) => PermissionCheckResult::deny(format!(
            "user '{}' is not authorized to {operation} field '{field}'",
            user.id
        )),
    }
}

/// Object-level check; `None` means "not denied here"
fn check_object(
    config: &PermissionConfig,
    rules: &CompiledRules,
    user: &UserContext,
    operation: Operation,
) -> Option<PermissionCheckResult> {
    config.object_permissions.as_ref()?;

    // Bitmask fast path when the rules are compiled
    if let Some(rule) = rules.object.as_ref() {
        if !rule.grants(operation) {
            return Some(no_roles(config, operation));
        }
    }

    match config.roles_for(operation) {
        None => Some(no_roles(config, operation)),
        Some(roles) if user.has_any_role(roles) => None,
        Some(_) => Some(PermissionCheckResult::deny(format!(
            "user '{}' is not authorized to {operation} {}",
            user.id, config.object
        ))),
    }
}

fn no_roles(config: &PermissionConfig, operation: Operation) -> PermissionCheckResult {
    PermissionCheckResult::deny(format!(
        "no roles configured for {operation} on {}",
        config.object
    ))
}

fn check_record_rules(
    rules: &CompiledRules,
    record: &serde_json::Value,
    user: &UserContext,
    operation: Operation,
) -> PermissionCheckResult {
    let user_value = user.to_value();
    rules
        .records
        .iter()
        .find(|rule| rule.grants(operation) && rule.matches(record, &user_value))
        .map_or_else(
            || PermissionCheckResult::deny("no record rules matched"),
            |rule| {
                PermissionCheckResult::grant(format!("granted by record rule '{}'", rule.rule_name))
                    .with_rule(&rule.rule_name)
            },
        )
}
