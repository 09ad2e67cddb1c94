//! Field-level security over result records

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use permgate_common::error::Result;
use permgate_common::types::{Operation, PermissionConfig, SecurityContext, UserContext};

use crate::loader::PermissionLoader;
use crate::mask::mask_value;

/// Removes unreadable fields and masks sensitive ones
pub struct FieldMasker {
    loader: Arc<PermissionLoader>,
}

impl FieldMasker {
    pub fn new(loader: Arc<PermissionLoader>) -> Self {
        Self { loader }
    }

    /// Secure each record for the context's user
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn apply_field_level_security(
        &self,
        object: &str,
        records: Vec<Value>,
        ctx: &SecurityContext,
        operation: Operation,
    ) -> Result<Vec<Value>> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(records);
        };
        debug!("Applying field-level security to {} {} records", records.len(), object);
        Ok(records
            .into_iter()
            .map(|record| secure_record(&config, record, ctx.user.as_ref(), operation))
            .collect())
    }

    /// Secure a single record
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn apply_to_record(
        &self,
        object: &str,
        record: Value,
        ctx: &SecurityContext,
        operation: Operation,
    ) -> Result<Value> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(record);
        };
        Ok(secure_record(&config, record, ctx.user.as_ref(), operation))
    }

    /// Fields the roles may access. Unrestricted fields are not listed; an
    /// object without configuration yields an empty list.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn get_accessible_fields(
        &self,
        object: &str,
        roles: &[String],
        operation: Operation,
    ) -> Result<Vec<String>> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(Vec::new());
        };
        Ok(config
            .field_permissions
            .iter()
            .filter(|(_, perm)| {
                perm.roles_for(operation)
                    .is_some_and(|allowed| intersects(allowed, roles))
            })
            .map(|(field, _)| field.clone())
            .collect())
    }

    /// Whether the roles may access `field`; unlisted fields are accessible
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn can_access_field(
        &self,
        object: &str,
        field: &str,
        roles: &[String],
        operation: Operation,
    ) -> Result<bool> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(true);
        };
        Ok(field_allowed(&config, field, roles, operation))
    }

    /// First field of `data` the roles may not write
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn first_forbidden_field(
        &self,
        object: &str,
        data: &Value,
        roles: &[String],
        operation: Operation,
    ) -> Result<Option<String>> {
        let Some(config) = self.loader.load(object).await? else {
            return Ok(None);
        };
        let Value::Object(map) = data else {
            return Ok(None);
        };
        Ok(map
            .keys()
            .find(|field| !field_allowed(&config, field, roles, operation))
            .cloned())
    }
}

fn intersects(allowed: &[String], roles: &[String]) -> bool {
    allowed.iter().any(|role| roles.contains(role))
}

fn field_allowed(config: &PermissionConfig, field: &str, roles: &[String], operation: Operation) -> bool {
    match config.field_permissions.get(field) {
        None => true,
        Some(perm) => perm
            .roles_for(operation)
            .is_some_and(|allowed| intersects(allowed, roles)),
    }
}

/// Apply field permissions and masking to one record.
///
/// Without a user every restricted or masked field is removed. Masking only
/// applies to reads.
#[must_use]
pub fn secure_record(
    config: &PermissionConfig,
    record: Value,
    user: Option<&UserContext>,
    operation: Operation,
) -> Value {
    let Value::Object(mut map) = record else {
        return record;
    };

    let Some(user) = user else {
        for field in config.field_permissions.keys().chain(config.field_masking.keys()) {
            map.remove(field);
        }
        return Value::Object(map);
    };

    for field in config.field_permissions.keys() {
        if !field_allowed(config, field, &user.roles, operation) {
            map.remove(field);
        }
    }

    if operation == Operation::Read {
        for (field, mask) in &config.field_masking {
            if user.has_any_role(&mask.visible_to) {
                continue;
            }
            if let Some(value) = map.get_mut(field) {
                *value = mask_value(value, &mask.mask_format);
            }
        }
    }

    Value::Object(map)
}
