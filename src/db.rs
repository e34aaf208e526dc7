use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

/// RFC 3339 with explicit UTC offset — every stored timestamp uses this.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap();

        // One row per user; ring buffers and profile ride in JSON columns.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversation_contexts (
                user_id TEXT PRIMARY KEY,
                context_data TEXT NOT NULL,
                profile TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL DEFAULT 'browsing',
                last_interaction TEXT NOT NULL,
                conversation_started TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contexts_last_interaction
                ON conversation_contexts(last_interaction);",
        )
        .expect("Failed to create conversation_contexts table");

        // Durable mirror of the in-memory priority queue.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS message_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                message_content TEXT NOT NULL,
                message_hash TEXT NOT NULL,
                source TEXT NOT NULL,
                transport_message_id TEXT NOT NULL DEFAULT '',
                conversation_id TEXT,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status ON message_queue(status);
            CREATE INDEX IF NOT EXISTS idx_queue_user ON message_queue(user_id);",
        )
        .expect("Failed to create message_queue table");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bot_states (
                user_id TEXT PRIMARY KEY,
                paused INTEGER NOT NULL DEFAULT 0,
                reason TEXT NOT NULL DEFAULT '',
                set_by TEXT NOT NULL DEFAULT '',
                paused_at TEXT NOT NULL,
                expires_at TEXT
            );",
        )
        .expect("Failed to create bot_states table");

        // Partial unique index enforces at most one pending job per
        // (user, stage).
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS follow_up_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                stage INTEGER NOT NULL,
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                context_snapshot TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                processed_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_followup_unique_pending
                ON follow_up_jobs(user_id, stage) WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_followup_due
                ON follow_up_jobs(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_followup_user
                ON follow_up_jobs(user_id);",
        )
        .expect("Failed to create follow_up_jobs table");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS follow_up_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                stage INTEGER NOT NULL,
                message_sent TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                responded INTEGER NOT NULL DEFAULT 0,
                responded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_followup_history_user
                ON follow_up_history(user_id);",
        )
        .expect("Failed to create follow_up_history table");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS follow_up_rate_limits (
                user_id TEXT PRIMARY KEY,
                last_sent_at TEXT,
                daily_count INTEGER NOT NULL DEFAULT 0,
                reset_date TEXT NOT NULL
            );",
        )
        .expect("Failed to create follow_up_rate_limits table");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS follow_up_blacklist (
                user_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL DEFAULT '',
                added_at TEXT NOT NULL
            );",
        )
        .expect("Failed to create follow_up_blacklist table");

        // Snapshot of admission buckets, refreshed as windows roll.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_limits (
                identifier TEXT PRIMARY KEY,
                window_size INTEGER NOT NULL,
                max_requests INTEGER NOT NULL,
                current_requests INTEGER NOT NULL,
                window_start TEXT NOT NULL
            );",
        )
        .expect("Failed to create rate_limits table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let path = format!(
            "/tmp/dispatch_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        {
            let db = Db::new(&path);
            db.migrate();
            let conn = db.conn.lock().unwrap();
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN (
                        'conversation_contexts','message_queue','bot_states',
                        'follow_up_jobs','follow_up_history','follow_up_rate_limits',
                        'follow_up_blacklist','rate_limits')",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(n, 8);
        }
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{path}-wal"));
        let _ = std::fs::remove_file(format!("{path}-shm"));
    }

    #[test]
    fn test_ts_round_trip() {
        let now = Utc::now();
        let s = to_rfc3339(now);
        let back = parse_ts(&s).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
