use crate::config::Config;
use crate::db::Db;
use crate::models::InboundMessage;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of the admission check, in evaluation order: dedup, then rate
/// buckets, then queue back-pressure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted,
    Duplicate,
    RateLimited { scope: &'static str },
    Busy,
}

/// Sliding-window limiter over request timestamps, one entry vector per
/// identifier key.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit and report whether the identifier stays under `max`
    /// within the window. Returns (allowed, current_count).
    pub fn check(&self, key: &str, max: usize, window_secs: u64) -> (bool, usize) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);

        let entries = windows.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return (false, entries.len());
        }
        entries.push(now);
        (true, entries.len())
    }
}

/// Recent `(userId, messageHash)` sightings with TTL; duplicates inside the
/// window are rejected before they reach the pipeline.
pub struct Deduper {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Deduper {
    pub fn new(ttl: Duration) -> Self {
        Deduper {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns true when the hash was already seen inside the TTL window.
    /// A miss records the hash.
    pub fn seen_recently(&self, hash: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if seen.len() > 4096 {
            let ttl = self.ttl;
            seen.retain(|_, at| now.duration_since(*at) < ttl);
        }
        let fresh = seen
            .get(hash)
            .map(|at| now.duration_since(*at) < self.ttl)
            .unwrap_or(false);
        if fresh {
            return true;
        }
        seen.insert(hash.to_string(), now);
        false
    }
}

pub struct Admission {
    config: Config,
    db: Arc<Db>,
    limiter: RateLimiter,
    deduper: Deduper,
}

impl Admission {
    pub fn new(config: Config, db: Arc<Db>) -> Self {
        let ttl = Duration::from_secs(config.dedup_ttl_secs);
        Admission {
            config,
            db,
            limiter: RateLimiter::new(),
            deduper: Deduper::new(ttl),
        }
    }

    /// Gatekeeper for every inbound message. `vip` users skip the per-user
    /// bucket but still count against the global one.
    pub fn admit(
        &self,
        msg: &InboundMessage,
        ip: &str,
        vip: bool,
        queue_depth: usize,
    ) -> AdmitDecision {
        if self.deduper.seen_recently(&msg.message_hash()) {
            return AdmitDecision::Duplicate;
        }

        if !vip {
            let key = format!("user:{}", msg.user_id);
            let (ok, current) = self.limiter.check(
                &key,
                self.config.user_rate_max,
                self.config.user_rate_window_secs,
            );
            self.persist_bucket(&key, self.config.user_rate_max, self.config.user_rate_window_secs, current);
            if !ok {
                return AdmitDecision::RateLimited { scope: "user" };
            }
        }

        let ip_key = format!("ip:{ip}");
        let (ok, current) = self.limiter.check(
            &ip_key,
            self.config.ip_rate_max,
            self.config.ip_rate_window_secs,
        );
        self.persist_bucket(&ip_key, self.config.ip_rate_max, self.config.ip_rate_window_secs, current);
        if !ok {
            return AdmitDecision::RateLimited { scope: "ip" };
        }

        let (ok, current) = self.limiter.check(
            "global",
            self.config.global_rate_max,
            self.config.global_rate_window_secs,
        );
        self.persist_bucket("global", self.config.global_rate_max, self.config.global_rate_window_secs, current);
        if !ok {
            return AdmitDecision::RateLimited { scope: "global" };
        }

        if queue_depth >= self.config.queue_soft_cap {
            return AdmitDecision::Busy;
        }

        AdmitDecision::Admitted
    }

    fn persist_bucket(&self, identifier: &str, max: usize, window_secs: u64, current: usize) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO rate_limits (identifier, window_size, max_requests, current_requests, window_start)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identifier) DO UPDATE SET
                 current_requests = excluded.current_requests,
                 window_start = excluded.window_start",
            params![
                identifier,
                window_secs as i64,
                max as i64,
                current as i64,
                crate::db::now_rfc3339()
            ],
        )
        .ok();
    }
}
