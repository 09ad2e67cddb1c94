//! TTL cache of permission decisions

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use permgate_common::types::{Operation, PermissionCheckResult, SecurityContext};

/// Identity of a decision: user, object, operation, record and field.
///
/// Record rules decide on the record's contents and the user's roles, so
/// both are part of the key alongside the record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub object: String,
    pub operation: Operation,
    pub record_id: Option<String>,
    /// Canonical JSON of the record under check
    pub record: Option<String>,
    pub field: Option<String>,
}

impl CacheKey {
    pub fn from_context(ctx: &SecurityContext) -> Self {
        Self {
            user_id: ctx.user_id().map(str::to_string),
            roles: sorted_roles(ctx),
            object: ctx.object_name.clone(),
            operation: ctx.operation,
            record_id: ctx.record_id.clone(),
            record: ctx.record.as_ref().map(ToString::to_string),
            field: ctx.field.clone(),
        }
    }
}

fn sorted_roles(ctx: &SecurityContext) -> Vec<String> {
    let mut roles = ctx.user.as_ref().map(|u| u.roles.clone()).unwrap_or_default();
    roles.sort_unstable();
    roles.dedup();
    roles
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.user_id.as_deref().unwrap_or("anonymous"),
            self.object,
            self.operation,
            self.record_id.as_deref().unwrap_or(""),
            self.field.as_deref().unwrap_or("")
        )
    }
}

struct CacheEntry {
    result: PermissionCheckResult,
    stored_at: Instant,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Decision cache; entries older than the TTL are treated as absent
pub struct PermissionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PermissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<PermissionCheckResult> {
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.stored_at.elapsed() <= self.ttl, entry.result.clone()));

        match lookup {
            Some((true, result)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Some((false, _)) => {
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, result: PermissionCheckResult) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every decision about `object`
    pub fn invalidate_object(&self, object: &str) {
        self.entries.retain(|key, _| key.object != object);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permgate_common::types::UserContext;
    use serde_json::json;

    fn key(object: &str) -> CacheKey {
        CacheKey::from_context(
            &SecurityContext::new(object, Operation::Read).with_user(UserContext::new("u1", &["member"])),
        )
    }

    #[test]
    fn test_key_format() {
        let ctx = SecurityContext::new("accounts", Operation::Update)
            .with_record_id("r9")
            .with_field("email");
        assert_eq!(CacheKey::from_context(&ctx).to_string(), "anonymous:accounts:update:r9:email");
    }

    #[test]
    fn test_key_distinguishes_records_and_roles() {
        let base = SecurityContext::new("docs", Operation::Update).with_user(UserContext::new("u1", &["member"]));
        let own = CacheKey::from_context(&base.clone().with_record(json!({ "owner": "u1" })));
        let foreign = CacheKey::from_context(&base.clone().with_record(json!({ "owner": "u2" })));
        assert_ne!(own, foreign);
        assert_ne!(own, CacheKey::from_context(&base));

        let admin = SecurityContext::new("docs", Operation::Update)
            .with_user(UserContext::new("u1", &["admin", "member"]));
        assert_ne!(CacheKey::from_context(&base), CacheKey::from_context(&admin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = PermissionCache::new(Duration::from_millis(100));
        cache.insert(key("a"), PermissionCheckResult::grant("ok"));

        assert!(cache.get(&key("a")).is_some());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cache.get(&key("a")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_invalidate_object() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        cache.insert(key("a"), PermissionCheckResult::grant("ok"));
        cache.insert(key("b"), PermissionCheckResult::deny("no"));

        cache.invalidate_object("a");
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.get(&key("b")).unwrap().reason, "no");

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
