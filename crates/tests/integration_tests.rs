//! Integration tests for permgate
//!
//! These tests drive the engine through its public surface: configuration
//! stores, the guard, query trimming, field masking and the data-access hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use permgate_common::config::{EngineConfig, StorageConfig, StorageType};
use permgate_common::error::{Error, Result};
use permgate_common::types::{
    ComparisonOperator, Condition, Operation, PermissionConfig, RecordRule, RecordRulePermissions,
    RlsException, RowLevelSecurity, SecurityContext, UserContext,
};
use permgate_engine::{
    mask_value, Filter, MutationHookContext, PermissionEngine, Query, QueryHookContext,
    QueryOutput, QueryTrimmer, ResultHookContext, RuleCompiler,
};
use permgate_store::{ConfigStore, DatabaseDriver, KeyValueClient, MemoryStore, SledClient, StorageBackends};

/// Store wrapper that counts single-object loads
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
}

#[async_trait]
impl ConfigStore for CountingStore {
    async fn load(&self, object: &str) -> Result<Option<PermissionConfig>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(object).await
    }

    async fn load_all(&self) -> Result<HashMap<String, PermissionConfig>> {
        self.inner.load_all().await
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "counting"
    }
}

/// In-process database driver, one row per object
#[derive(Default)]
struct TableDriver {
    rows: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl DatabaseDriver for TableDriver {
    async fn find_one(&self, _table: &str, object: &str) -> Result<Option<Value>> {
        Ok(self.rows.lock().get(object).cloned())
    }

    async fn find_all(&self, _table: &str) -> Result<Vec<Value>> {
        Ok(self.rows.lock().values().cloned().collect())
    }

    async fn upsert(&self, _table: &str, object: &str, row: Value) -> Result<()> {
        self.rows.lock().insert(object.to_string(), row);
        Ok(())
    }

    async fn delete(&self, _table: &str, object: &str) -> Result<()> {
        self.rows.lock().remove(object);
        Ok(())
    }
}

fn accounts() -> PermissionConfig {
    PermissionConfig::new("accounts")
        .allow(Operation::Read, &["member", "admin"])
        .allow(Operation::Create, &["admin"])
}

fn employees() -> PermissionConfig {
    PermissionConfig::new("employees")
        .allow(Operation::Read, &["member", "hr"])
        .with_field("salary", Some(&["hr"]), Some(&["hr"]))
        .with_field("card", Some(&["member", "hr"]), None)
        .with_mask("card", "****-****-****-{last4}", &["hr"])
}

fn tickets() -> PermissionConfig {
    PermissionConfig::new("tickets")
        .allow(Operation::Read, &["member", "admin"])
        .with_row_level_security(RowLevelSecurity {
            enabled: true,
            default_rule: Some(Condition::formula(
                "status == 'active' && owner == $current_user.id",
            )),
            exceptions: vec![RlsException {
                role: "admin".into(),
                bypass: true,
                condition: None,
            }],
        })
}

/// Test helper to create an engine over a seeded memory store
async fn create_test_engine(configs: Vec<PermissionConfig>) -> PermissionEngine {
    let config = EngineConfig {
        permissions: configs,
        enable_audit: true,
        ..Default::default()
    };
    PermissionEngine::new(config, StorageBackends::default())
        .await
        .expect("Failed to create engine")
}

fn user(id: &str, roles: &[&str]) -> UserContext {
    UserContext::new(id, roles)
}

// ============================================================================
// Guard Tests
// ============================================================================

#[tokio::test]
async fn test_unconfigured_object_grants_everything() {
    let engine = create_test_engine(vec![accounts()]).await;

    for operation in Operation::ALL {
        let anonymous = SecurityContext::new("widgets", operation);
        assert!(engine.check_permission(&anonymous).await.granted);

        let ctx = SecurityContext::new("widgets", operation).with_user(user("u1", &[]));
        assert!(engine.check_permission(&ctx).await.granted);
    }
}

#[tokio::test]
async fn test_member_reads_but_cannot_create() {
    let engine = create_test_engine(vec![accounts()]).await;
    let member = user("u1", &["member"]);

    let read = SecurityContext::new("accounts", Operation::Read).with_user(member.clone());
    assert!(engine.check_permission(&read).await.granted);

    let create = SecurityContext::new("accounts", Operation::Create).with_user(member);
    let result = engine.check_permission(&create).await;
    assert!(!result.granted);
    assert!(result.reason.contains("not authorized"));

    match engine.enforce(&create).await {
        Err(Error::PermissionDenied { reason, operation, .. }) => {
            assert_eq!(operation, "create");
            assert!(reason.contains("not authorized"));
        }
        other => panic!("expected denial, got {other:?}"),
    }

    let audit = engine.audit_log();
    assert_eq!(audit.len(), 3);
    assert!(audit[0].granted);
    assert!(!audit[1].granted);
}

#[tokio::test]
async fn test_record_rule_attribution() {
    let config = PermissionConfig::new("projects")
        .with_record_rule(RecordRule::new(
            "team-member",
            Some(Condition::simple("team", ComparisonOperator::Eq, json!("$current_user.team"))),
            RecordRulePermissions::all(),
        ))
        .with_record_rule(
            RecordRule::new(
                "archived-readonly",
                Some(Condition::formula("archived == true")),
                RecordRulePermissions::read_only(),
            )
            .with_priority(10),
        );
    let engine = create_test_engine(vec![config]).await;
    let member = user("u1", &["member"]).with_attribute("team", json!("red"));

    let ctx = SecurityContext::new("projects", Operation::Update)
        .with_user(member.clone())
        .with_record(json!({ "team": "red", "archived": true }));
    let result = engine.check_permission(&ctx).await;
    assert!(result.granted);
    assert_eq!(result.rule.as_deref(), Some("team-member"));

    let read = SecurityContext::new("projects", Operation::Read)
        .with_user(member)
        .with_record(json!({ "team": "red", "archived": true }));
    assert_eq!(
        engine.check_permission(&read).await.rule.as_deref(),
        Some("archived-readonly")
    );
}

// ============================================================================
// Compiler Tests
// ============================================================================

#[test]
fn test_compiled_record_rules_never_increase_in_priority() {
    let mut config = PermissionConfig::new("docs");
    for (i, priority) in [3, -1, 7, 7, 0, 12, 3].into_iter().enumerate() {
        config = config.with_record_rule(
            RecordRule::new(&format!("rule-{i}"), None, RecordRulePermissions::read_only())
                .with_priority(priority),
        );
    }

    let compiled = RuleCompiler::compile(&config);
    assert_eq!(compiled.records.len(), 7);
    assert!(compiled
        .records
        .windows(2)
        .all(|pair| pair[0].priority >= pair[1].priority));

    // equal priorities keep declaration order
    let sevens: Vec<&str> = compiled
        .records
        .iter()
        .filter(|r| r.priority == 7)
        .map(|r| r.rule_name.as_str())
        .collect();
    assert_eq!(sevens, vec!["rule-2", "rule-3"]);
}

// ============================================================================
// Cache Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_hits_store_once_within_ttl() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::with_configs([accounts()]),
        loads: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        cache_ttl_ms: 1_000,
        ..Default::default()
    };
    let engine = PermissionEngine::with_store(config, store.clone())
        .await
        .expect("Failed to create engine");
    let ctx = SecurityContext::new("accounts", Operation::Read).with_user(user("u1", &["member"]));

    for _ in 0..5 {
        assert!(engine.check_permission(&ctx).await.granted);
    }
    assert_eq!(store.loads.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(engine.check_permission(&ctx).await.granted);
    assert_eq!(store.loads.load(Ordering::SeqCst), 2);

    let stats = engine.cache_stats().expect("cache enabled");
    assert_eq!(stats.hits, 4);
    assert_eq!(stats.misses, 2);
}

#[tokio::test]
async fn test_disabled_cache_hits_store_every_time() {
    let store = Arc::new(CountingStore {
        inner: MemoryStore::with_configs([accounts()]),
        loads: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        enable_cache: false,
        ..Default::default()
    };
    let engine = PermissionEngine::with_store(config, store.clone())
        .await
        .expect("Failed to create engine");
    let ctx = SecurityContext::new("accounts", Operation::Read).with_user(user("u1", &["member"]));

    engine.check_permission(&ctx).await;
    engine.check_permission(&ctx).await;
    assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    assert!(engine.cache_stats().is_none());
}

// ============================================================================
// Query Trimming Tests
// ============================================================================

#[tokio::test]
async fn test_formula_becomes_and_filter() {
    let engine = create_test_engine(vec![tickets()]).await;
    let mut query = Query::new();
    let ctx = SecurityContext::new("tickets", Operation::Read).with_user(user("u1", &["member"]));

    engine
        .trimmer()
        .apply_row_level_security("tickets", &mut query, &ctx)
        .await
        .expect("Failed to trim query");

    assert_eq!(
        query.filter_document(),
        json!({ "$and": [{ "status": "active" }, { "owner": "u1" }] })
    );
}

#[tokio::test]
async fn test_bypass_role_gets_unfiltered_query() {
    let engine = create_test_engine(vec![tickets()]).await;
    let original = Query::new().with_filter(Filter::equals("priority", json!("high")));

    for roles in [&["admin"][..], &["member", "admin"][..]] {
        let mut hook = QueryHookContext::new("tickets", original.clone()).with_user(user("a1", roles));
        engine.before_query(&mut hook).await.expect("before_query failed");
        assert_eq!(hook.query.filters, original.filters);
        assert!(!hook.skip);
    }
}

#[tokio::test]
async fn test_anonymous_query_is_impossible() {
    let engine = create_test_engine(vec![tickets()]).await;

    let mut query = Query::new();
    engine
        .trimmer()
        .apply_row_level_security("tickets", &mut query, &SecurityContext::new("tickets", Operation::Read))
        .await
        .expect("Failed to trim query");
    assert_eq!(query.filter_document(), json!({ "id": null }));
    assert!(QueryTrimmer::is_query_impossible(&query));

    let mut hook = QueryHookContext::new("tickets", Query::new());
    engine.before_query(&mut hook).await.expect("before_query failed");
    assert!(hook.skip);
    assert_eq!(hook.result, Some(Vec::new()));
}

#[tokio::test]
async fn test_untranslatable_rule_is_enforced_after_fetch() {
    let config = PermissionConfig::new("notes").with_row_level_security(RowLevelSecurity {
        enabled: true,
        default_rule: Some(Condition::formula(
            "(owner == $current_user.id || shared == true) && deleted != true",
        )),
        exceptions: vec![],
    });
    let engine = create_test_engine(vec![config]).await;
    let member = user("u1", &["member"]);

    let mut strict = Query::new();
    let err = engine
        .trimmer()
        .apply_row_level_security(
            "notes",
            &mut strict,
            &SecurityContext::new("notes", Operation::Read).with_user(member.clone()),
        )
        .await
        .expect_err("formula should not translate");
    assert!(matches!(err, Error::Translation(_)));
    assert!(strict.filters.is_none());

    let mut before = QueryHookContext::new("notes", Query::new()).with_user(member.clone());
    engine.before_query(&mut before).await.expect("before_query failed");
    assert_eq!(before.query.residual.len(), 1);

    let fetched = vec![
        json!({ "id": 1, "owner": "u1" }),
        json!({ "id": 2, "owner": "u2", "shared": true }),
        json!({ "id": 3, "owner": "u2" }),
        json!({ "id": 4, "owner": "u1", "deleted": true }),
    ];
    let mut after = ResultHookContext::new("notes", QueryOutput::Many(fetched))
        .with_user(member)
        .with_residual(before.query.residual.clone());
    engine.after_query(&mut after).await.expect("after_query failed");

    let QueryOutput::Many(records) = after.result else {
        panic!("expected many records");
    };
    let ids: Vec<i64> = records.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, vec![1, 2]);
}

// ============================================================================
// Field Security Tests
// ============================================================================

#[tokio::test]
async fn test_readers_see_value_or_mask_never_both_removed_and_masked() {
    let engine = create_test_engine(vec![employees()]).await;
    let record = json!({ "id": "e1", "salary": 90_000, "card": "4111111111111234" });

    let cases = [
        (user("g", &["guest"]), false, false),
        (user("m", &["member"]), false, true),
        (user("h", &["hr"]), true, true),
    ];

    for (reader, sees_salary, sees_card) in cases {
        let ctx = SecurityContext::new("employees", Operation::Read).with_user(reader.clone());
        let out = engine
            .masker()
            .apply_to_record("employees", record.clone(), &ctx, Operation::Read)
            .await
            .expect("Failed to mask record");

        assert_eq!(out.get("salary").is_some(), sees_salary, "salary for {:?}", reader.roles);
        assert_eq!(out.get("card").is_some(), sees_card, "card for {:?}", reader.roles);

        if let Some(card) = out.get("card") {
            if reader.has_role("hr") {
                assert_eq!(card, "4111111111111234");
            } else {
                assert_eq!(card, "****-****-****-1234");
            }
        }
    }
}

#[test]
fn test_masking_is_deterministic() {
    let value = json!("4111111111111234");
    let first = mask_value(&value, "****-****-****-{last4}");
    let second = mask_value(&value, "****-****-****-{last4}");
    assert_eq!(first, second);

    let masked = first.as_str().expect("masked string");
    assert!(masked.contains('-'));
    assert!(masked.ends_with("1234"));
    assert!(!masked.contains("4111111111111234"));
}

#[tokio::test]
async fn test_field_write_denied_by_mutation_hook() {
    let engine = create_test_engine(vec![employees().allow(Operation::Update, &["member", "hr"])]).await;

    let mut raise = MutationHookContext::new("employees", Operation::Update)
        .with_user(user("m", &["member"]))
        .with_id("e1")
        .with_data(json!({ "salary": 1 }));
    let err = engine
        .before_mutation(&mut raise)
        .await
        .expect_err("member may not write salary");
    assert!(err.is_denied());

    let mut hr = raise.clone().with_user(user("h", &["hr"]));
    engine.before_mutation(&mut hr).await.expect("hr may write salary");
    assert!(!hr.skip);
}

// ============================================================================
// Storage Backend Tests
// ============================================================================

#[tokio::test]
async fn test_sled_store_seed_and_reload() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = EngineConfig {
        storage: StorageConfig {
            kind: StorageType::KeyValue,
            path: Some(temp_dir.path().join("permissions")),
            ..Default::default()
        },
        permissions: vec![accounts()],
        ..Default::default()
    };
    let engine = PermissionEngine::new(config, StorageBackends::default())
        .await
        .expect("Failed to create engine");
    let ctx = SecurityContext::new("accounts", Operation::Create).with_user(user("u1", &["member"]));
    assert!(!engine.check_permission(&ctx).await.granted);

    engine
        .save_config(accounts().allow(Operation::Create, &["member"]))
        .await
        .expect("Failed to save config");
    assert!(engine.check_permission(&ctx).await.granted);

    engine.reload().await.expect("Failed to reload");
    assert_eq!(engine.loader().compiled_objects(), vec!["accounts".to_string()]);
}

#[tokio::test]
async fn test_key_value_store_with_injected_client() {
    let client = Arc::new(SledClient::temporary().expect("Failed to open sled"));
    client
        .set("perm:accounts", &serde_json::to_string(&accounts()).expect("serialize"))
        .await
        .expect("Failed to write document");

    let config = EngineConfig {
        storage: StorageConfig {
            kind: StorageType::KeyValue,
            key_prefix: "perm:".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = PermissionEngine::new(config, StorageBackends::default().with_key_value(client))
        .await
        .expect("Failed to create engine");

    let ctx = SecurityContext::new("accounts", Operation::Read).with_user(user("u1", &["member"]));
    assert!(engine.check_permission(&ctx).await.granted);
}

#[tokio::test]
async fn test_database_store_through_driver() {
    let driver = Arc::new(TableDriver::default());
    let config = EngineConfig {
        storage: StorageConfig {
            kind: StorageType::Database,
            ..Default::default()
        },
        permissions: vec![accounts()],
        ..Default::default()
    };
    let engine = PermissionEngine::new(config, StorageBackends::default().with_driver(driver.clone()))
        .await
        .expect("Failed to create engine");

    let row = driver
        .find_one("_permissions", "accounts")
        .await
        .expect("Failed to read row")
        .expect("row was seeded");
    assert!(row["config"].is_string());

    let ctx = SecurityContext::new("accounts", Operation::Create).with_user(user("a", &["admin"]));
    assert!(engine.check_permission(&ctx).await.granted);
}

#[tokio::test]
async fn test_custom_store_is_required_when_selected() {
    let config = EngineConfig {
        storage: StorageConfig {
            kind: StorageType::Custom,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = PermissionEngine::new(config.clone(), StorageBackends::default()).await;
    assert!(matches!(result, Err(Error::Config(_))));

    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::with_configs([accounts()]));
    let engine = PermissionEngine::new(config, StorageBackends::default().with_custom(store))
        .await
        .expect("Failed to create engine");
    assert_eq!(engine.store().kind(), "memory");
}
