use crate::cache::TtlCache;
use crate::config::Config;
use crate::db::{self, Db};
use crate::errors::DispatchError;
use crate::models::ConversationContext;
use lru::LruCache;
use rusqlite::params;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct L1Entry {
    ctx: ConversationContext,
    stored_at: Instant,
}

/// Three-tier store of per-user conversation contexts:
/// L1 in-process LRU → L2 shared TTL cache → L3 `conversation_contexts`.
/// Reads walk down and promote; writes go through L3 synchronously with
/// L1/L2 refreshed best-effort. Mutations serialize per user.
pub struct ContextStore {
    db: Arc<Db>,
    cache: Arc<TtlCache>,
    l1: Mutex<LruCache<String, L1Entry>>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    l1_ttl: Duration,
    l2_ttl: Duration,
}

fn l2_key(user_id: &str) -> String {
    format!("ctx:{user_id}")
}

impl ContextStore {
    pub fn new(config: &Config, db: Arc<Db>, cache: Arc<TtlCache>) -> Self {
        let capacity = NonZeroUsize::new(config.l1_capacity.max(1)).unwrap();
        ContextStore {
            db,
            cache,
            l1: Mutex::new(LruCache::new(capacity)),
            user_locks: Mutex::new(HashMap::new()),
            l1_ttl: Duration::from_secs(config.l1_ttl_secs),
            l2_ttl: Duration::from_secs(config.l2_ttl_secs),
        }
    }

    /// Fetch a user's context, walking L1 → L2 → L3 and promoting hits.
    /// Unknown users get a fresh context with no side effects.
    pub fn get(&self, user_id: &str) -> ConversationContext {
        {
            let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            let cached = l1.get(user_id).map(|entry| {
                (entry.stored_at.elapsed() < self.l1_ttl).then(|| entry.ctx.clone())
            });
            match cached {
                Some(Some(ctx)) => return ctx,
                // Stale entry: drop it and fall through to L2.
                Some(None) => {
                    l1.pop(user_id);
                }
                None => {}
            }
        }

        if let Some(raw) = self.cache.get(&l2_key(user_id))
            && let Ok(ctx) = serde_json::from_str::<ConversationContext>(&raw)
        {
            self.promote_l1(ctx.clone());
            return ctx;
        }

        if let Some(ctx) = self.load_row(user_id) {
            self.promote_l2(&ctx);
            self.promote_l1(ctx.clone());
            return ctx;
        }

        ConversationContext::fresh(user_id)
    }

    /// Read-modify-write under the user's mutex. L3 write is synchronous and
    /// its failure fails the dispatch as retriable; cache tiers refresh
    /// best-effort afterwards.
    pub fn update<F>(&self, user_id: &str, mutator: F) -> Result<ConversationContext, DispatchError>
    where
        F: FnOnce(&mut ConversationContext),
    {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut ctx = self.get(user_id);
        mutator(&mut ctx);
        if ctx.last_interaction < ctx.conversation_started {
            ctx.last_interaction = ctx.conversation_started;
        }

        self.store_row(&ctx)?;
        self.promote_l2(&ctx);
        self.promote_l1(ctx.clone());
        Ok(ctx)
    }

    /// Refresh `last_interaction` without touching anything else.
    pub fn touch(&self, user_id: &str) -> Result<(), DispatchError> {
        self.update(user_id, |ctx| ctx.touch()).map(|_| ())
    }

    pub fn is_vip(&self, user_id: &str) -> bool {
        self.get(user_id).profile.vip
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > 10_000 {
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn promote_l1(&self, ctx: ConversationContext) {
        let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
        l1.put(
            ctx.user_id.clone(),
            L1Entry {
                ctx,
                stored_at: Instant::now(),
            },
        );
    }

    fn promote_l2(&self, ctx: &ConversationContext) {
        if let Ok(raw) = serde_json::to_string(ctx) {
            self.cache.set(&l2_key(&ctx.user_id), &raw, self.l2_ttl);
        }
    }

    fn load_row(&self, user_id: &str) -> Option<ConversationContext> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let raw: String = conn
            .query_row(
                "SELECT context_data FROM conversation_contexts WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn store_row(&self, ctx: &ConversationContext) -> Result<(), DispatchError> {
        let context_data = serde_json::to_string(ctx)
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        let profile = serde_json::to_string(&ctx.profile)
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO conversation_contexts
                (user_id, context_data, profile, state, last_interaction,
                 conversation_started, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                 context_data = excluded.context_data,
                 profile = excluded.profile,
                 state = excluded.state,
                 last_interaction = excluded.last_interaction,
                 updated_at = excluded.updated_at",
            params![
                ctx.user_id,
                context_data,
                profile,
                ctx.state.as_str(),
                db::to_rfc3339(ctx.last_interaction),
                db::to_rfc3339(ctx.conversation_started),
                db::now_rfc3339(),
            ],
        )
        .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngagementLevel, TurnRole};

    fn test_store() -> (ContextStore, Arc<Db>, Arc<TtlCache>, String) {
        let path = format!(
            "/tmp/dispatch_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        let db = Arc::new(Db::new(&path));
        let cache = Arc::new(TtlCache::new());
        let store = ContextStore::new(&Config::default(), db.clone(), cache.clone());
        (store, db, cache, path)
    }

    fn cleanup(path: &str) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{path}-wal"));
        let _ = std::fs::remove_file(format!("{path}-shm"));
    }

    #[test]
    fn test_unknown_user_gets_fresh_context_without_row() {
        let (store, db, _cache, path) = test_store();
        let ctx = store.get("5493511234567");
        assert_eq!(ctx.state, crate::models::ConversationState::Browsing);
        assert!(ctx.interaction_history.is_empty());
        let conn = db.conn.lock().unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversation_contexts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
        cleanup(&path);
    }

    #[test]
    fn test_update_writes_through_and_reads_back() {
        let (store, _db, _cache, path) = test_store();
        store
            .update("u1", |ctx| {
                ctx.push_turn(TurnRole::User, "hola");
                ctx.push_turn(TurnRole::Assistant, "buenas!");
                ctx.profile.engagement_level = EngagementLevel::Medium;
                ctx.touch();
            })
            .unwrap();
        let ctx = store.get("u1");
        assert_eq!(ctx.interaction_history.len(), 2);
        assert_eq!(ctx.profile.engagement_level, EngagementLevel::Medium);
        cleanup(&path);
    }

    #[test]
    fn test_l3_fallback_after_cache_tiers_cleared() {
        let (store, db, cache, path) = test_store();
        store
            .update("u1", |ctx| ctx.push_turn(TurnRole::User, "hola"))
            .unwrap();

        // Fresh store over the same db simulates a process restart with cold
        // caches; L2 is emptied too.
        cache.remove("ctx:u1");
        let cold = ContextStore::new(&Config::default(), db.clone(), Arc::new(TtlCache::new()));
        let ctx = cold.get("u1");
        assert_eq!(ctx.interaction_history.len(), 1);
        assert_eq!(ctx.interaction_history[0].text, "hola");
        cleanup(&path);
    }

    #[test]
    fn test_l2_hit_serves_without_db() {
        let (store, _db, cache, path) = test_store();
        store
            .update("u1", |ctx| ctx.push_turn(TurnRole::User, "hola"))
            .unwrap();
        assert!(cache.get("ctx:u1").is_some());

        // A different store sharing only the cache still resolves the user.
        let other_db_path = format!(
            "/tmp/dispatch_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        let other = ContextStore::new(
            &Config::default(),
            Arc::new(Db::new(&other_db_path)),
            cache.clone(),
        );
        let ctx = other.get("u1");
        assert_eq!(ctx.interaction_history.len(), 1);
        cleanup(&path);
        cleanup(&other_db_path);
    }

    #[test]
    fn test_durable_round_trip_structural_equality() {
        let (store, _db, _cache, path) = test_store();
        let written = store
            .update("u1", |ctx| {
                ctx.profile.customer_type = Some("entrepreneur".to_string());
                ctx.profile.questions_asked.push("precio?".to_string());
                ctx.push_turn(TurnRole::User, "precio?");
            })
            .unwrap();
        let read = store.load_row("u1").unwrap();
        assert_eq!(
            serde_json::to_value(&written).unwrap(),
            serde_json::to_value(&read).unwrap()
        );
        cleanup(&path);
    }

    #[test]
    fn test_last_interaction_never_precedes_start() {
        let (store, _db, _cache, path) = test_store();
        let ctx = store
            .update("u1", |ctx| {
                ctx.last_interaction = ctx.conversation_started - chrono::Duration::hours(1);
            })
            .unwrap();
        assert!(ctx.last_interaction >= ctx.conversation_started);
        cleanup(&path);
    }
}
