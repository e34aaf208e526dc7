use crate::cache::TtlCache;
use crate::db::{self, Db};
use crate::models::BotState;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

/// Reason recorded by a force-activate, which supervisory signals may not
/// demote.
pub const FORCE_ACTIVE_REASON: &str = "force-active";

/// Per-user paused/active flag. The shared cache is the fast path with TTL
/// expiry; `bot_states` mirrors every change for crash recovery. No record
/// (or an expired one) means active.
pub struct BotGate {
    db: Arc<Db>,
    cache: Arc<TtlCache>,
}

fn cache_key(user_id: &str) -> String {
    format!("botstate:{user_id}")
}

impl BotGate {
    pub fn new(db: Arc<Db>, cache: Arc<TtlCache>) -> Self {
        BotGate { db, cache }
    }

    pub fn get_state(&self, user_id: &str) -> Option<BotState> {
        let now = Utc::now();
        if let Some(raw) = self.cache.get(&cache_key(user_id))
            && let Ok(state) = serde_json::from_str::<BotState>(&raw)
        {
            if state.is_expired(now) {
                self.clear(user_id);
                return None;
            }
            return Some(state);
        }

        let state = self.load_row(user_id)?;
        if state.is_expired(now) {
            self.clear(user_id);
            return None;
        }
        self.cache_state(&state);
        Some(state)
    }

    pub fn is_paused(&self, user_id: &str) -> bool {
        self.get_state(user_id).map(|s| s.paused).unwrap_or(false)
    }

    pub fn is_force_active(&self, user_id: &str) -> bool {
        self.get_state(user_id)
            .map(|s| !s.paused && s.reason == FORCE_ACTIVE_REASON)
            .unwrap_or(false)
    }

    /// Operator-grade pause: always wins, including over force-active.
    /// Re-pausing refreshes reason and expiry.
    pub fn pause(&self, user_id: &str, reason: &str, set_by: &str, ttl: Duration) {
        let now = Utc::now();
        let state = BotState {
            user_id: user_id.to_string(),
            paused: true,
            reason: reason.to_string(),
            set_by: set_by.to_string(),
            paused_at: now,
            expires_at: Some(now + ChronoDuration::seconds(ttl.as_secs() as i64)),
        };
        self.store_row(&state);
        self.cache_state(&state);
    }

    /// Supervisory pause: refuses to demote a force-active user. Returns
    /// whether the pause took effect.
    pub fn pause_supervisory(&self, user_id: &str, reason: &str, set_by: &str, ttl: Duration) -> bool {
        if self.is_force_active(user_id) {
            return false;
        }
        self.pause(user_id, reason, set_by, ttl);
        true
    }

    /// Clear any paused state; absence of a record means active.
    pub fn resume(&self, user_id: &str) {
        self.clear(user_id);
    }

    /// Resume only when the current pause carries the given reason; used by
    /// supervisory status/assignee transitions.
    pub fn resume_if_reason(&self, user_id: &str, reason: &str) -> bool {
        match self.get_state(user_id) {
            Some(state) if state.paused && state.reason == reason => {
                self.clear(user_id);
                true
            }
            _ => false,
        }
    }

    /// Unconditionally mark the user active and pin them there against
    /// supervisory signals.
    pub fn force_activate(&self, user_id: &str, set_by: &str) {
        let now = Utc::now();
        let state = BotState {
            user_id: user_id.to_string(),
            paused: false,
            reason: FORCE_ACTIVE_REASON.to_string(),
            set_by: set_by.to_string(),
            paused_at: now,
            expires_at: None,
        };
        self.store_row(&state);
        self.cache_state(&state);
    }

    /// Admin sweep: clear every paused record. Returns how many were cleared.
    pub fn resume_all(&self) -> usize {
        let users: Vec<String> = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = match conn.prepare("SELECT user_id FROM bot_states WHERE paused = 1") {
                Ok(s) => s,
                Err(_) => return 0,
            };
            match stmt.query_map([], |row| row.get(0)) {
                Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
                Err(_) => return 0,
            }
        };
        for user in &users {
            self.clear(user);
        }
        users.len()
    }

    fn clear(&self, user_id: &str) {
        self.cache.remove(&cache_key(user_id));
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM bot_states WHERE user_id = ?1", params![user_id])
            .ok();
    }

    fn cache_state(&self, state: &BotState) {
        let ttl = match state.expires_at {
            Some(exp) => {
                let secs = (exp - Utc::now()).num_seconds().max(1) as u64;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(24 * 3600),
        };
        if let Ok(raw) = serde_json::to_string(state) {
            self.cache.set(&cache_key(&state.user_id), &raw, ttl);
        }
    }

    fn load_row(&self, user_id: &str) -> Option<BotState> {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT user_id, paused, reason, set_by, paused_at, expires_at
             FROM bot_states WHERE user_id = ?1",
            params![user_id],
            |row| {
                let paused_at_raw: String = row.get(4)?;
                let expires_raw: Option<String> = row.get(5)?;
                Ok(BotState {
                    user_id: row.get(0)?,
                    paused: row.get::<_, i64>(1)? != 0,
                    reason: row.get(2)?,
                    set_by: row.get(3)?,
                    paused_at: db::parse_ts(&paused_at_raw).unwrap_or_else(Utc::now),
                    expires_at: expires_raw.and_then(|r| db::parse_ts(&r)),
                })
            },
        )
        .ok()
    }

    fn store_row(&self, state: &BotState) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO bot_states (user_id, paused, reason, set_by, paused_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                 paused = excluded.paused,
                 reason = excluded.reason,
                 set_by = excluded.set_by,
                 paused_at = excluded.paused_at,
                 expires_at = excluded.expires_at",
            params![
                state.user_id,
                state.paused as i64,
                state.reason,
                state.set_by,
                db::to_rfc3339(state.paused_at),
                state.expires_at.map(db::to_rfc3339),
            ],
        )
        .ok();
    }
}
