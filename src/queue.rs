use crate::db::{self, Db};
use crate::models::{InboundMessage, ItemStatus, Priority, QueuedItem, Source};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Items retried at most this many times before dead-lettering.
pub const MAX_ATTEMPTS: u32 = 3;

/// Per-user bounded set of recently submitted hashes (submit-time dedup).
const RECENT_HASHES_PER_USER: usize = 20;

/// `processing` rows older than this at startup are presumed orphaned by a
/// crashed worker and reverted to `pending`.
const LIVENESS_THRESHOLD_SECS: i64 = 300;

/// Retry backoff: `2^attempts × 500 ms`, capped at 30 s.
pub fn backoff(attempts: u32) -> Duration {
    let ms = 500u64.saturating_mul(1u64 << attempts.min(16));
    Duration::from_millis(ms.min(30_000))
}

/// How a worker reports the fate of a leased item.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    /// Replied (or intentionally skipped, e.g. paused user).
    Success,
    /// Transient failure; the queue decides between retry and dead-letter.
    Retriable(String),
    /// Terminal failure; straight to dead-letter.
    Permanent(String),
}

/// What the queue did with the ack, so the caller can react (apology on
/// dead-letter, metrics).
#[derive(Debug, Clone)]
pub enum AckResult {
    Completed,
    Retried { attempts: u32, delay: Duration },
    DeadLettered(Box<QueuedItem>),
}

struct Inner {
    levels: [VecDeque<QueuedItem>; 4],
    processing: HashMap<String, QueuedItem>,
    processing_users: HashSet<String>,
    recent_hashes: HashMap<String, VecDeque<String>>,
}

/// Four-level FIFO queue with a durable mirror in `message_queue`. Lease
/// order is strict priority, FIFO within a level, skipping users that
/// already have an item in flight.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    db: Arc<Db>,
}

impl PriorityQueue {
    pub fn new(db: Arc<Db>) -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                levels: [
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                processing: HashMap::new(),
                processing_users: HashSet::new(),
                recent_hashes: HashMap::new(),
            }),
            notify: Notify::new(),
            db,
        }
    }

    /// Submit a coalesced message. Returns the queued item, or `None` when
    /// the submit-time dedup set already holds this `(user, hash)`.
    pub fn submit(&self, message: InboundMessage, priority: Priority) -> Option<QueuedItem> {
        let hash = message.message_hash();
        let item = QueuedItem::new(message, priority);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let recent = inner
                .recent_hashes
                .entry(item.user_id.clone())
                .or_default();
            if recent.contains(&hash) {
                return None;
            }
            recent.push_back(hash.clone());
            while recent.len() > RECENT_HASHES_PER_USER {
                recent.pop_front();
            }
            inner.levels[item.priority as usize].push_back(item.clone());
        }
        self.insert_row(&item, &hash);
        self.notify.notify_waiters();
        Some(item)
    }

    /// Lease the next eligible item for a worker, or `None` when every
    /// candidate is future-scheduled or fairness-blocked.
    pub fn try_lease(&self, worker_id: &str) -> Option<QueuedItem> {
        let now = Utc::now();
        let leased = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut found: Option<(usize, usize)> = None;
            'levels: for (level_idx, level) in inner.levels.iter().enumerate() {
                for (pos, item) in level.iter().enumerate() {
                    if item.scheduled_at > now {
                        continue;
                    }
                    // Fairness: a user with an in-flight item waits their turn.
                    if inner.processing_users.contains(&item.user_id) {
                        continue;
                    }
                    found = Some((level_idx, pos));
                    break 'levels;
                }
            }
            let (level_idx, pos) = found?;
            let mut item = inner.levels[level_idx].remove(pos)?;
            item.status = ItemStatus::Processing;
            item.worker_id = Some(worker_id.to_string());
            item.started_at = Some(now);
            inner.processing_users.insert(item.user_id.clone());
            inner.processing.insert(item.queue_id.clone(), item.clone());
            item
        };
        self.update_row_leased(&leased);
        Some(leased)
    }

    /// Report the outcome of a leased item.
    pub fn ack(&self, queue_id: &str, outcome: AckOutcome) -> Option<AckResult> {
        let mut item = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let item = inner.processing.remove(queue_id)?;
            inner.processing_users.remove(&item.user_id);
            item
        };
        let now = Utc::now();

        let result = match outcome {
            AckOutcome::Success => {
                item.status = ItemStatus::Completed;
                item.completed_at = Some(now);
                AckResult::Completed
            }
            AckOutcome::Retriable(err) => {
                item.attempts += 1;
                item.last_error = Some(err);
                if item.attempts >= MAX_ATTEMPTS {
                    item.status = ItemStatus::DeadLetter;
                    item.completed_at = Some(now);
                    AckResult::DeadLettered(Box::new(item.clone()))
                } else {
                    let delay = backoff(item.attempts);
                    item.status = ItemStatus::Pending;
                    item.worker_id = None;
                    item.started_at = None;
                    item.scheduled_at = now
                        + ChronoDuration::milliseconds(delay.as_millis() as i64);
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.levels[item.priority as usize].push_back(item.clone());
                    AckResult::Retried {
                        attempts: item.attempts,
                        delay,
                    }
                }
            }
            AckOutcome::Permanent(err) => {
                item.attempts += 1;
                item.last_error = Some(err);
                item.status = ItemStatus::DeadLetter;
                item.completed_at = Some(now);
                AckResult::DeadLettered(Box::new(item.clone()))
            }
        };
        self.update_row_acked(&item);
        if matches!(result, AckResult::Retried { .. }) {
            self.notify.notify_waiters();
        }
        Some(result)
    }

    /// Pending items across all levels (includes future-scheduled retries).
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.levels.iter().map(|l| l.len()).sum()
    }

    pub fn depth_by_priority(&self) -> [usize; 4] {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        [
            inner.levels[0].len(),
            inner.levels[1].len(),
            inner.levels[2].len(),
            inner.levels[3].len(),
        ]
    }

    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.processing.len()
    }

    /// Wait for a submit or retry wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Crash recovery at startup: revert stale `processing` rows to
    /// `pending`, then reload every pending row into memory.
    pub fn recover(&self) -> usize {
        let cutoff = db::to_rfc3339(Utc::now() - ChronoDuration::seconds(LIVENESS_THRESHOLD_SECS));
        let rows: Vec<QueuedItem> = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "UPDATE message_queue SET status = 'pending', worker_id = NULL, started_at = NULL
                 WHERE status = 'processing' AND started_at < ?1",
                params![cutoff],
            )
            .ok();
            let mut stmt = match conn.prepare(
                "SELECT queue_id, user_id, message_content, source, transport_message_id,
                        conversation_id, priority, attempts, created_at, scheduled_at, last_error
                 FROM message_queue WHERE status = 'pending' ORDER BY id ASC",
            ) {
                Ok(s) => s,
                Err(_) => return 0,
            };
            let mapped = stmt.query_map([], |row| {
                let source_raw: String = row.get(3)?;
                let priority_raw: String = row.get(6)?;
                let created_raw: String = row.get(8)?;
                let scheduled_raw: String = row.get(9)?;
                Ok(QueuedItem {
                    queue_id: row.get(0)?,
                    user_id: row.get::<_, String>(1)?,
                    message: InboundMessage {
                        user_id: row.get(1)?,
                        text: row.get(2)?,
                        source: Source::parse(&source_raw).unwrap_or(Source::Whatsapp),
                        transport_message_id: row.get(4)?,
                        conversation_id: row.get(5)?,
                        arrived_at: db::parse_ts(&created_raw).unwrap_or_else(Utc::now),
                        raw_metadata: serde_json::json!({}),
                    },
                    priority: Priority::parse(&priority_raw).unwrap_or(Priority::Normal),
                    status: ItemStatus::Pending,
                    attempts: row.get::<_, i64>(7)? as u32,
                    worker_id: None,
                    created_at: db::parse_ts(&created_raw).unwrap_or_else(Utc::now),
                    scheduled_at: db::parse_ts(&scheduled_raw).unwrap_or_else(Utc::now),
                    started_at: None,
                    completed_at: None,
                    last_error: row.get(10)?,
                })
            });
            match mapped {
                Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
                Err(_) => return 0,
            }
        };

        let recovered = rows.len();
        if recovered > 0 {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for item in rows {
                inner.levels[item.priority as usize].push_back(item);
            }
        }
        if recovered > 0 {
            eprintln!("♻️  Queue recovery: reloaded {recovered} pending items");
            self.notify.notify_waiters();
        }
        recovered
    }

    // --- durable mirror ---

    fn insert_row(&self, item: &QueuedItem, hash: &str) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO message_queue
                (queue_id, user_id, message_content, message_hash, source,
                 transport_message_id, conversation_id, priority, status,
                 attempts, created_at, scheduled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                item.queue_id,
                item.user_id,
                item.message.text,
                hash,
                item.message.source.as_str(),
                item.message.transport_message_id,
                item.message.conversation_id,
                item.priority.as_str(),
                item.status.as_str(),
                item.attempts as i64,
                db::to_rfc3339(item.created_at),
                db::to_rfc3339(item.scheduled_at),
            ],
        )
        .ok();
    }

    fn update_row_leased(&self, item: &QueuedItem) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE message_queue SET status = 'processing', worker_id = ?1, started_at = ?2
             WHERE queue_id = ?3",
            params![
                item.worker_id,
                item.started_at.map(db::to_rfc3339),
                item.queue_id
            ],
        )
        .ok();
    }

    fn update_row_acked(&self, item: &QueuedItem) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE message_queue SET status = ?1, attempts = ?2, worker_id = ?3,
                    started_at = ?4, scheduled_at = ?5, completed_at = ?6, last_error = ?7
             WHERE queue_id = ?8",
            params![
                item.status.as_str(),
                item.attempts as i64,
                item.worker_id,
                item.started_at.map(db::to_rfc3339),
                db::to_rfc3339(item.scheduled_at),
                item.completed_at.map(db::to_rfc3339),
                item.last_error,
                item.queue_id
            ],
        )
        .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_queue() -> (PriorityQueue, Arc<Db>, String) {
        let path = format!(
            "/tmp/dispatch_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        let db = Arc::new(Db::new(&path));
        (PriorityQueue::new(db.clone()), db, path)
    }

    fn cleanup(path: &str) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{path}-wal"));
        let _ = std::fs::remove_file(format!("{path}-shm"));
    }

    fn msg(user: &str, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: user.to_string(),
            text: text.to_string(),
            source: Source::Whatsapp,
            transport_message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: None,
            arrived_at: Utc::now(),
            raw_metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(3), Duration::from_millis(4000));
        assert_eq!(backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn test_urgent_dominates_normal() {
        let (queue, _db, path) = test_queue();
        for i in 0..5 {
            queue.submit(msg(&format!("u{i}"), "hola"), Priority::Normal);
        }
        queue.submit(msg("vip", "ya mismo"), Priority::Urgent);
        let leased = queue.try_lease("w1").unwrap();
        assert_eq!(leased.user_id, "vip");
        assert_eq!(leased.priority, Priority::Urgent);
        cleanup(&path);
    }

    #[test]
    fn test_fifo_within_level() {
        let (queue, _db, path) = test_queue();
        queue.submit(msg("u1", "primero"), Priority::Normal);
        queue.submit(msg("u2", "segundo"), Priority::Normal);
        assert_eq!(queue.try_lease("w1").unwrap().message.text, "primero");
        assert_eq!(queue.try_lease("w1").unwrap().message.text, "segundo");
        cleanup(&path);
    }

    #[test]
    fn test_fairness_skips_user_in_flight() {
        let (queue, _db, path) = test_queue();
        queue.submit(msg("u1", "uno"), Priority::Normal);
        queue.submit(msg("u1", "dos"), Priority::Normal);
        queue.submit(msg("u2", "tres"), Priority::Normal);

        let first = queue.try_lease("w1").unwrap();
        assert_eq!(first.message.text, "uno");
        // u1 busy: next lease must skip "dos" and hand out u2's item.
        let second = queue.try_lease("w2").unwrap();
        assert_eq!(second.message.text, "tres");
        // Nothing else eligible while both users are in flight.
        assert!(queue.try_lease("w3").is_none());

        queue.ack(&first.queue_id, AckOutcome::Success);
        assert_eq!(queue.try_lease("w3").unwrap().message.text, "dos");
        cleanup(&path);
    }

    #[test]
    fn test_submit_dedup_within_recent_set() {
        let (queue, _db, path) = test_queue();
        assert!(queue.submit(msg("u1", "hola"), Priority::Normal).is_some());
        assert!(queue.submit(msg("u1", "hola"), Priority::Normal).is_none());
        assert!(queue.submit(msg("u2", "hola"), Priority::Normal).is_some());
        cleanup(&path);
    }

    #[test]
    fn test_retriable_failure_backs_off_then_dead_letters() {
        let (queue, db, path) = test_queue();
        queue.submit(msg("u1", "hola"), Priority::Normal);

        let first = queue.try_lease("w1").unwrap();
        let result = queue
            .ack(&first.queue_id, AckOutcome::Retriable("timeout".into()))
            .unwrap();
        match result {
            AckResult::Retried { attempts, delay } => {
                assert_eq!(attempts, 1);
                assert_eq!(delay, Duration::from_millis(1000));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        // Backoff means it is not immediately leasable.
        assert!(queue.try_lease("w1").is_none());
        assert_eq!(queue.depth(), 1);

        // Force the remaining attempts through by rewinding scheduled_at.
        for _ in 0..2 {
            {
                let mut inner = queue.inner.lock().unwrap();
                for level in inner.levels.iter_mut() {
                    for item in level.iter_mut() {
                        item.scheduled_at = Utc::now() - ChronoDuration::seconds(1);
                    }
                }
            }
            let leased = queue.try_lease("w1").unwrap();
            let result = queue
                .ack(&leased.queue_id, AckOutcome::Retriable("timeout".into()))
                .unwrap();
            if let AckResult::DeadLettered(item) = &result {
                assert_eq!(item.attempts, MAX_ATTEMPTS);
            }
        }
        assert_eq!(queue.depth(), 0);

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM message_queue WHERE user_id = 'u1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "dead_letter");
        cleanup(&path);
    }

    #[test]
    fn test_permanent_failure_dead_letters_immediately() {
        let (queue, _db, path) = test_queue();
        queue.submit(msg("u1", "hola"), Priority::Normal);
        let leased = queue.try_lease("w1").unwrap();
        let result = queue
            .ack(&leased.queue_id, AckOutcome::Permanent("404".into()))
            .unwrap();
        assert!(matches!(result, AckResult::DeadLettered(_)));
        assert_eq!(queue.depth(), 0);
        cleanup(&path);
    }

    #[test]
    fn test_recover_reverts_stale_processing() {
        let (queue, db, path) = test_queue();
        queue.submit(msg("u1", "hola"), Priority::High);
        let leased = queue.try_lease("w1").unwrap();

        // Simulate a crash: stamp started_at far in the past and rebuild.
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE message_queue SET started_at = ?1 WHERE queue_id = ?2",
                params![
                    db::to_rfc3339(Utc::now() - ChronoDuration::hours(1)),
                    leased.queue_id
                ],
            )
            .unwrap();
        }
        let rebuilt = PriorityQueue::new(db.clone());
        let recovered = rebuilt.recover();
        assert_eq!(recovered, 1);
        let item = rebuilt.try_lease("w2").unwrap();
        assert_eq!(item.user_id, "u1");
        assert_eq!(item.priority, Priority::High);
        cleanup(&path);
    }

    #[test]
    fn test_recover_ignores_fresh_processing() {
        let (queue, db, path) = test_queue();
        queue.submit(msg("u1", "hola"), Priority::Normal);
        queue.try_lease("w1").unwrap();
        let rebuilt = PriorityQueue::new(db.clone());
        assert_eq!(rebuilt.recover(), 0);
        cleanup(&path);
    }
}
