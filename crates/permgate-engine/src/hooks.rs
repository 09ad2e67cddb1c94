//! Data-access hooks a host calls around its queries and mutations

use serde_json::Value;
use tracing::{debug, error};

use permgate_common::error::Result;
use permgate_common::types::{Operation, PermissionCheckResult, SecurityContext, UserContext};

use crate::engine::{denial, PermissionEngine};
use crate::filter::{Query, ResidualClause};
use crate::trimmer::{QueryTrimmer, TranslationMode};

/// Pre-query hook state
#[derive(Debug, Clone)]
pub struct QueryHookContext {
    pub object_name: String,
    pub query: Query,
    pub user: Option<UserContext>,
    /// Extra roles merged into the user's
    pub roles: Vec<String>,
    /// Set when the query can be answered without hitting the data layer
    pub skip: bool,
    /// Result to return when `skip` is set
    pub result: Option<Vec<Value>>,
}

impl QueryHookContext {
    pub fn new(object_name: &str, query: Query) -> Self {
        Self {
            object_name: object_name.to_string(),
            query,
            user: None,
            roles: Vec::new(),
            skip: false,
            result: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| (*r).to_string()).collect();
        self
    }
}

/// Pre-mutation hook state
#[derive(Debug, Clone)]
pub struct MutationHookContext {
    pub object_name: String,
    pub operation: Operation,
    pub user: Option<UserContext>,
    pub roles: Vec<String>,
    pub id: Option<String>,
    /// Values being written
    pub data: Option<Value>,
    /// Stored record before an update or delete
    pub previous: Option<Value>,
    /// Set when the mutation was denied without raising
    pub skip: bool,
}

impl MutationHookContext {
    pub fn new(object_name: &str, operation: Operation) -> Self {
        Self {
            object_name: object_name.to_string(),
            operation,
            user: None,
            roles: Vec::new(),
            id: None,
            data: None,
            previous: None,
            skip: false,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }
}

/// Query output handed to the post-query hook
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    One(Value),
    Many(Vec<Value>),
}

/// Post-query hook state
#[derive(Debug, Clone)]
pub struct ResultHookContext {
    pub object_name: String,
    pub result: QueryOutput,
    pub user: Option<UserContext>,
    pub roles: Vec<String>,
    /// Conditions deferred by [`PermissionEngine::before_query`]
    pub residual: Vec<ResidualClause>,
}

impl ResultHookContext {
    pub fn new(object_name: &str, result: QueryOutput) -> Self {
        Self {
            object_name: object_name.to_string(),
            result,
            user: None,
            roles: Vec::new(),
            residual: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_residual(mut self, residual: Vec<ResidualClause>) -> Self {
        self.residual = residual;
        self
    }
}

fn effective_user(user: Option<&UserContext>, roles: &[String]) -> Option<UserContext> {
    user.cloned().map(|mut user| {
        user.merge_roles(roles);
        user
    })
}

impl PermissionEngine {
    /// Narrow a read query with row-level security and record rules.
    ///
    /// Conditions that cannot become filters are left on `query.residual` for
    /// [`PermissionEngine::after_query`].
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn before_query(&self, hook: &mut QueryHookContext) -> Result<()> {
        if self.bypasses(&hook.object_name) {
            return Ok(());
        }

        let mut ctx = SecurityContext::new(&hook.object_name, Operation::Read);
        ctx.user = effective_user(hook.user.as_ref(), &hook.roles);

        if self.config.enable_row_level_security {
            self.trimmer
                .apply_row_level_security_with(&hook.object_name, &mut hook.query, &ctx, TranslationMode::Defer)
                .await?;
        }
        self.trimmer
            .apply_record_rules_with(
                &hook.object_name,
                &mut hook.query,
                &ctx,
                Operation::Read,
                TranslationMode::Defer,
            )
            .await?;

        if QueryTrimmer::is_query_impossible(&hook.query) {
            debug!("Query on {} can match no rows; skipping", hook.object_name);
            hook.skip = true;
            hook.result = Some(Vec::new());
        }
        Ok(())
    }

    /// Authorize a create, update or delete.
    ///
    /// # Errors
    /// `Error::PermissionDenied` when denied and `throw_on_denied` is set;
    /// otherwise a denial only sets `hook.skip`.
    pub async fn before_mutation(&self, hook: &mut MutationHookContext) -> Result<()> {
        if self.bypasses(&hook.object_name) {
            return Ok(());
        }

        let mut ctx = SecurityContext::new(&hook.object_name, hook.operation);
        ctx.user = effective_user(hook.user.as_ref(), &hook.roles);
        ctx.record_id.clone_from(&hook.id);
        if matches!(hook.operation, Operation::Update | Operation::Delete) {
            ctx.record.clone_from(&hook.previous);
        }

        let mut result = self.check_permission(&ctx).await;
        if result.granted && self.config.enable_field_level_security {
            if let Some(data) = hook.data.as_ref() {
                result = self.check_written_fields(&ctx, data).await;
            }
        }

        if result.granted {
            return Ok(());
        }
        if self.config.throw_on_denied {
            return Err(denial(&ctx, &result));
        }
        debug!("Skipping {} on {}: {}", ctx.operation, ctx.object_name, result.reason);
        hook.skip = true;
        Ok(())
    }

    /// Drop records failing deferred conditions, then apply field-level security.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn after_query(&self, hook: &mut ResultHookContext) -> Result<()> {
        if self.bypasses(&hook.object_name) {
            return Ok(());
        }

        let mut ctx = SecurityContext::new(&hook.object_name, Operation::Read);
        ctx.user = effective_user(hook.user.as_ref(), &hook.roles);

        if !hook.residual.is_empty() {
            let user = ctx.user.as_ref();
            let passes = |record: &Value| hook.residual.iter().all(|clause| clause.matches(record, user));
            match &mut hook.result {
                QueryOutput::Many(records) => records.retain(|record| passes(record)),
                QueryOutput::One(record) => {
                    if !record.is_null() && !passes(record) {
                        *record = Value::Null;
                    }
                }
            }
        }

        if !self.config.enable_field_level_security {
            return Ok(());
        }

        match &mut hook.result {
            QueryOutput::Many(records) => {
                let taken = std::mem::take(records);
                *records = self
                    .masker
                    .apply_field_level_security(&hook.object_name, taken, &ctx, Operation::Read)
                    .await?;
            }
            QueryOutput::One(record) => {
                if !record.is_null() {
                    let taken = record.take();
                    *record = self
                        .masker
                        .apply_to_record(&hook.object_name, taken, &ctx, Operation::Read)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn check_written_fields(&self, ctx: &SecurityContext, data: &Value) -> PermissionCheckResult {
        match self
            .masker
            .first_forbidden_field(&ctx.object_name, data, ctx.roles(), ctx.operation)
            .await
        {
            Ok(None) => PermissionCheckResult::grant("all written fields permitted"),
            Ok(Some(field)) => PermissionCheckResult::deny(format!(
                "user '{}' is not authorized to {} field '{}'",
                ctx.user_id().unwrap_or("anonymous"),
                ctx.operation,
                field
            )),
            Err(e) => {
                error!("Failed to load field permissions for {}: {}", ctx.object_name, e);
                PermissionCheckResult::deny("permission configuration unavailable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use permgate_common::config::EngineConfig;
    use permgate_common::types::{
        ComparisonOperator, Condition, PermissionConfig, RecordRule, RecordRulePermissions,
        RlsException, RowLevelSecurity,
    };
    use permgate_store::StorageBackends;
    use serde_json::json;

    fn tickets() -> PermissionConfig {
        PermissionConfig::new("tickets")
            .allow(Operation::Read, &["member", "admin"])
            .allow(Operation::Update, &["member", "admin"])
            .allow(Operation::Create, &["member"])
            .with_field("priority", Some(&["member", "admin"]), Some(&["admin"]))
            .with_mask("reporter_email", "***@***.***", &["admin"])
            .with_record_rule(RecordRule::new(
                "own",
                Some(Condition::simple("owner", ComparisonOperator::Eq, json!("$current_user.id"))),
                RecordRulePermissions::all(),
            ))
            .with_row_level_security(RowLevelSecurity {
                enabled: true,
                default_rule: Some(Condition::formula("tenant == $current_user.tenant")),
                exceptions: vec![RlsException {
                    role: "admin".into(),
                    bypass: true,
                    condition: None,
                }],
            })
    }

    async fn engine(throw_on_denied: bool) -> PermissionEngine {
        let config = EngineConfig {
            throw_on_denied,
            permissions: vec![tickets()],
            ..Default::default()
        };
        PermissionEngine::new(config, StorageBackends::default()).await.unwrap()
    }

    fn member() -> UserContext {
        UserContext::new("u1", &["member"]).with_attribute("tenant", json!("t1"))
    }

    #[tokio::test]
    async fn test_before_query_injects_filters() {
        let engine = engine(true).await;
        let mut hook = QueryHookContext::new("tickets", Query::new()).with_user(member());
        engine.before_query(&mut hook).await.unwrap();

        assert!(!hook.skip);
        assert_eq!(
            hook.query.filter_document(),
            json!({ "$and": [{ "tenant": "t1" }, { "owner": "u1" }] })
        );
    }

    #[tokio::test]
    async fn test_before_query_without_user_short_circuits() {
        let engine = engine(true).await;
        let mut hook = QueryHookContext::new("tickets", Query::new());
        engine.before_query(&mut hook).await.unwrap();
        assert!(hook.skip);
        assert_eq!(hook.result, Some(vec![]));
    }

    #[tokio::test]
    async fn test_hook_roles_are_merged() {
        let engine = engine(true).await;
        let mut hook = QueryHookContext::new("tickets", Query::new())
            .with_user(member())
            .with_roles(&["admin"]);
        engine.before_query(&mut hook).await.unwrap();
        // admin bypasses RLS; record rules still apply
        assert_eq!(hook.query.filters, Some(Filter::equals("owner", json!("u1"))));
    }

    #[tokio::test]
    async fn test_before_mutation_record_rule_and_fields() {
        let engine = engine(true).await;

        let mut own = MutationHookContext::new("tickets", Operation::Update)
            .with_user(member())
            .with_id("t-1")
            .with_data(json!({ "title": "new" }))
            .with_previous(json!({ "owner": "u1", "title": "old" }));
        engine.before_mutation(&mut own).await.unwrap();

        let mut foreign = own.clone().with_previous(json!({ "owner": "u2" }));
        let err = engine.before_mutation(&mut foreign).await.unwrap_err();
        assert!(err.is_denied());

        let mut priority = own.clone().with_data(json!({ "priority": "high" }));
        let err = engine.before_mutation(&mut priority).await.unwrap_err();
        assert!(err.to_string().contains("priority"));
    }

    #[tokio::test]
    async fn test_before_mutation_soft_deny() {
        let engine = engine(false).await;
        let mut hook = MutationHookContext::new("tickets", Operation::Delete)
            .with_user(member())
            .with_previous(json!({ "owner": "u1" }));
        engine.before_mutation(&mut hook).await.unwrap();
        assert!(hook.skip);

        let mut create = MutationHookContext::new("tickets", Operation::Create)
            .with_user(member())
            .with_data(json!({ "title": "t" }));
        engine.before_mutation(&mut create).await.unwrap();
        assert!(!create.skip);
    }

    #[tokio::test]
    async fn test_after_query_masks_and_filters_residual() {
        let engine = engine(true).await;
        let records = vec![
            json!({ "id": 1, "owner": "u1", "priority": "low", "reporter_email": "ann@corp.io", "status": "open" }),
            json!({ "id": 2, "owner": "u1", "status": "closed" }),
        ];
        let mut hook = ResultHookContext::new("tickets", QueryOutput::Many(records))
            .with_user(UserContext::new("u1", &["guest"]))
            .with_residual(vec![ResidualClause::All(Condition::formula("status == 'open'"))]);
        engine.after_query(&mut hook).await.unwrap();

        let QueryOutput::Many(out) = hook.result else {
            panic!("expected many");
        };
        assert_eq!(out.len(), 1);
        assert!(out[0].get("priority").is_none());
        assert_eq!(out[0]["reporter_email"], "a*n@c**p.io");
    }

    #[tokio::test]
    async fn test_after_query_single_record() {
        let engine = engine(true).await;
        let mut hook = ResultHookContext::new(
            "tickets",
            QueryOutput::One(json!({ "id": 1, "priority": "low", "reporter_email": "ann@corp.io" })),
        )
        .with_user(UserContext::new("a", &["admin"]));
        engine.after_query(&mut hook).await.unwrap();
        assert_eq!(
            hook.result,
            QueryOutput::One(json!({ "id": 1, "priority": "low", "reporter_email": "ann@corp.io" }))
        );
    }
}
