use crate::config::Config;
use crate::context::ContextStore;
use crate::db::{self, Db};
use crate::errors::DispatchError;
use crate::gate::BotGate;
use crate::metrics::Metrics;
use crate::models::{ContextSnapshot, EngagementLevel, FollowUpJob, FollowUpStatus, Source};
use crate::transport::TransportSender;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rusqlite::params;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Offsets from the last user activity, in hours. Index = stage. The hour
/// values are the enumerated day cadence 1h, 1d, 2d, 4d, 7d, 10d, 14d, 18d,
/// 26d, 36d, 46d, 56d, 66d.
pub const STAGE_OFFSETS_HOURS: [i64; 13] = [
    1, 24, 48, 96, 168, 240, 336, 432, 624, 864, 1104, 1344, 1584,
];

/// Recurring maintenance stage after the scripted cadence ends.
pub const MAINTENANCE_STAGE: usize = 13;
pub const MAINTENANCE_INTERVAL_HOURS: i64 = 360;

pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Outcome of the pre-send guard chain for one due job. A failed guard
/// never advances or drops the stage; the job moves to the next valid
/// window and is re-evaluated there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardResult {
    Pass,
    Reschedule {
        to: DateTime<Utc>,
        guard: &'static str,
    },
}

/// Durable timer store for the 14-stage re-engagement cadence. Armed after
/// every successful reply, fully reset by any inbound message, dispatched by
/// a ticker that checks guards before each send.
pub struct FollowupScheduler {
    config: Config,
    db: Arc<Db>,
    gate: Arc<BotGate>,
    contexts: Arc<ContextStore>,
    sender: Arc<dyn TransportSender>,
    metrics: Arc<Metrics>,
}

impl FollowupScheduler {
    pub fn new(
        config: Config,
        db: Arc<Db>,
        gate: Arc<BotGate>,
        contexts: Arc<ContextStore>,
        sender: Arc<dyn TransportSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        FollowupScheduler {
            config,
            db,
            gate,
            contexts,
            sender,
            metrics,
        }
    }

    // --- activation & reset ---

    /// Called by the worker after every successful reply: rewind to stage 0
    /// with a fresh snapshot of the conversation.
    pub fn on_user_activity(&self, user_id: &str) {
        self.cancel_pending(user_id);
        if self.is_blacklisted(user_id) {
            return;
        }
        let ctx = self.contexts.get(user_id);
        let snapshot = ContextSnapshot::capture(&ctx);
        let at = Utc::now() + ChronoDuration::hours(STAGE_OFFSETS_HOURS[0]);
        if self.insert_job(user_id, 0, at, &snapshot) {
            self.metrics.followup_armed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Called on every admitted inbound message: any user interaction
    /// rewinds the sequence (a new stage-0 job is armed after the next
    /// successful reply).
    pub fn on_inbound(&self, user_id: &str) {
        let cancelled = self.cancel_pending(user_id);
        if cancelled > 0 {
            self.metrics
                .followup_cancelled
                .fetch_add(cancelled as u64, Ordering::Relaxed);
        }
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE follow_up_history SET responded = 1, responded_at = ?1
             WHERE user_id = ?2 AND responded = 0",
            params![db::now_rfc3339(), user_id],
        )
        .ok();
    }

    fn cancel_pending(&self, user_id: &str) -> usize {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE follow_up_jobs SET status = 'cancelled', processed_at = ?1
             WHERE user_id = ?2 AND status = 'pending'",
            params![db::now_rfc3339(), user_id],
        )
        .unwrap_or(0)
    }

    /// Insert a job unless a pending one already holds `(user, stage)`.
    /// Returns whether a row landed.
    fn insert_job(
        &self,
        user_id: &str,
        stage: usize,
        scheduled_for: DateTime<Utc>,
        snapshot: &ContextSnapshot,
    ) -> bool {
        let snapshot_json = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO follow_up_jobs
                (job_id, user_id, stage, scheduled_for, status, attempts,
                 context_snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                user_id,
                stage as i64,
                db::to_rfc3339(scheduled_for),
                snapshot_json,
                db::now_rfc3339(),
            ],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    // --- blacklist & admin ---

    pub fn is_blacklisted(&self, user_id: &str) -> bool {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM follow_up_blacklist WHERE user_id = ?1",
            params![user_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    /// Admin: lift any blacklist entry and arm the sequence from stage 0.
    pub fn activate(&self, user_id: &str) {
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "DELETE FROM follow_up_blacklist WHERE user_id = ?1",
                params![user_id],
            )
            .ok();
        }
        self.on_user_activity(user_id);
    }

    /// Admin: blacklist the user and cancel anything queued.
    pub fn deactivate(&self, user_id: &str, reason: &str) {
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO follow_up_blacklist (user_id, reason, added_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET reason = excluded.reason",
                params![user_id, reason, db::now_rfc3339()],
            )
            .ok();
        }
        let cancelled = self.cancel_pending(user_id);
        if cancelled > 0 {
            self.metrics
                .followup_cancelled
                .fetch_add(cancelled as u64, Ordering::Relaxed);
        }
    }

    pub fn status(&self, user_id: &str) -> serde_json::Value {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let pending: Vec<serde_json::Value> = conn
            .prepare(
                "SELECT stage, scheduled_for, attempts FROM follow_up_jobs
                 WHERE user_id = ?1 AND status = 'pending' ORDER BY stage",
            )
            .ok()
            .map(|mut stmt| {
                stmt.query_map(params![user_id], |row| {
                    Ok(serde_json::json!({
                        "stage": row.get::<_, i64>(0)?,
                        "scheduled_for": row.get::<_, String>(1)?,
                        "attempts": row.get::<_, i64>(2)?,
                    }))
                })
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
                .unwrap_or_default()
            })
            .unwrap_or_default();

        let sent_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM follow_up_history WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let blacklisted: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM follow_up_blacklist WHERE user_id = ?1",
                params![user_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let (daily_count, reset_date): (i64, Option<String>) = conn
            .query_row(
                "SELECT daily_count, reset_date FROM follow_up_rate_limits WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap_or((0, None));

        serde_json::json!({
            "user_id": user_id,
            "active": blacklisted == 0,
            "pending_jobs": pending,
            "sent_total": sent_count,
            "daily_count": daily_count,
            "daily_reset_date": reset_date,
        })
    }

    // --- guards ---

    fn local_today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.config.followup_tz).date_naive()
    }

    fn daily_count_for(&self, user_id: &str, today: NaiveDate) -> u32 {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT daily_count, reset_date FROM follow_up_rate_limits WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok();
        match row {
            Some((count, date)) if date == today.to_string() => count as u32,
            _ => 0,
        }
    }

    fn next_valid_window(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        next_window(
            from,
            self.config.followup_tz,
            self.config.followup_start_hour,
            self.config.followup_end_hour,
            &self.config.followup_weekdays,
        )
    }

    pub fn evaluate_guards(&self, job: &FollowUpJob, now: DateTime<Utc>) -> GuardResult {
        // Deactivation already cancels pending jobs; a due job for a
        // blacklisted user is a stray, held back an hour at a time.
        if self.is_blacklisted(&job.user_id) {
            return GuardResult::Reschedule {
                to: self.next_valid_window(now + ChronoDuration::hours(1)),
                guard: "blacklist",
            };
        }

        let window = self.next_valid_window(now);
        if window != now {
            return GuardResult::Reschedule {
                to: window,
                guard: "send-window",
            };
        }

        let today = self.local_today(now);
        if self.daily_count_for(&job.user_id, today) >= 1 {
            // Next civil day at the window start.
            let tomorrow = at_local_hour(
                self.config.followup_tz,
                today.succ_opt().unwrap_or(today),
                self.config.followup_start_hour,
            );
            return GuardResult::Reschedule {
                to: self.next_valid_window(tomorrow),
                guard: "daily-cap",
            };
        }

        if self.gate.is_paused(&job.user_id) {
            return GuardResult::Reschedule {
                to: self.next_valid_window(now + ChronoDuration::hours(1)),
                guard: "paused",
            };
        }

        // The stage-0 reset cancels superseded jobs at admission; a newer
        // interaction than the snapshot means this one slipped through a
        // race, so it waits for the reset to catch up. Fresh
        // (never-persisted) contexts are stamped with the read time, so
        // only a user with real history can supersede.
        let ctx = self.contexts.get(&job.user_id);
        if let Some(snap_at) = job.context_snapshot.snapshot_at
            && !ctx.interaction_history.is_empty()
            && ctx.last_interaction > snap_at
        {
            return GuardResult::Reschedule {
                to: self.next_valid_window(now + ChronoDuration::hours(1)),
                guard: "superseded-by-reply",
            };
        }

        GuardResult::Pass
    }

    // --- dispatch ---

    fn load_due(&self, now: DateTime<Utc>, migration_mode: bool) -> Vec<FollowUpJob> {
        let now_s = db::to_rfc3339(now);
        let sql = if migration_mode {
            // Migration safety valve: only pending jobs, never failed retries.
            "SELECT job_id, user_id, stage, scheduled_for, status, attempts,
                    context_snapshot, created_at
             FROM follow_up_jobs
             WHERE status = 'pending' AND scheduled_for <= ?1
             ORDER BY scheduled_for ASC LIMIT 50"
        } else {
            "SELECT job_id, user_id, stage, scheduled_for, status, attempts,
                    context_snapshot, created_at
             FROM follow_up_jobs
             WHERE scheduled_for <= ?1
               AND (status = 'pending' OR (status = 'failed' AND attempts < 3))
             ORDER BY scheduled_for ASC LIMIT 50"
        };
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map(params![now_s], |row| {
            let scheduled_raw: String = row.get(3)?;
            let status_raw: String = row.get(4)?;
            let snapshot_raw: String = row.get(6)?;
            let created_raw: String = row.get(7)?;
            Ok(FollowUpJob {
                job_id: row.get(0)?,
                user_id: row.get(1)?,
                stage: row.get::<_, i64>(2)? as usize,
                scheduled_for: db::parse_ts(&scheduled_raw).unwrap_or_else(Utc::now),
                status: match status_raw.as_str() {
                    "failed" => FollowUpStatus::Failed,
                    _ => FollowUpStatus::Pending,
                },
                attempts: row.get::<_, i64>(5)? as u32,
                context_snapshot: serde_json::from_str(&snapshot_raw).unwrap_or_default(),
                created_at: db::parse_ts(&created_raw).unwrap_or_else(Utc::now),
                processed_at: None,
            })
        });
        match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// One scheduler pass: guard, render and send every due job. Returns the
    /// number of follow-ups actually sent.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let migration_mode = self
            .config
            .migration_mode_until
            .map(|until| now < until)
            .unwrap_or(false);
        let due = self.load_due(now, migration_mode);
        let mut sent = 0;

        for job in due {
            match self.evaluate_guards(&job, now) {
                GuardResult::Reschedule { to, guard } => {
                    self.reschedule(&job, to);
                    self.metrics
                        .followup_skipped_guard
                        .fetch_add(1, Ordering::Relaxed);
                    eprintln!(
                        "⏭️  Follow-up u={} stage={} held by {guard}, next {}",
                        job.user_id, job.stage, to
                    );
                }
                GuardResult::Pass => {
                    self.set_status(&job.job_id, "processing");
                    let text = render_message(
                        job.stage,
                        &job.context_snapshot,
                        now,
                        self.config.followup_tz,
                    );
                    let (source, conversation_id) = self.route_for(&job.user_id);
                    match self
                        .sender
                        .send(&job.user_id, &text, source, conversation_id.as_deref())
                        .await
                    {
                        Ok(()) => {
                            self.finalize_sent(&job, &text, now);
                            sent += 1;
                        }
                        Err(err) => self.record_send_failure(&job, &err, now),
                    }
                }
            }
        }
        sent
    }

    /// Pick the outbound transport from the user's last known routes.
    fn route_for(&self, user_id: &str) -> (Source, Option<String>) {
        let ctx = self.contexts.get(user_id);
        if let Some(cid) = ctx.conversation_ids.get(Source::Chatwoot.as_str()) {
            return (Source::Chatwoot, Some(cid.clone()));
        }
        if ctx.conversation_ids.contains_key(Source::Test.as_str()) {
            return (Source::Test, None);
        }
        (Source::Whatsapp, None)
    }

    pub fn finalize_sent(&self, job: &FollowUpJob, text: &str, now: DateTime<Utc>) {
        let today = self.local_today(now);
        {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "UPDATE follow_up_jobs SET status = 'sent', processed_at = ?1 WHERE job_id = ?2",
                params![db::to_rfc3339(now), job.job_id],
            )
            .ok();
            conn.execute(
                "INSERT INTO follow_up_history (user_id, stage, message_sent, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job.user_id, job.stage as i64, text, db::to_rfc3339(now)],
            )
            .ok();
            conn.execute(
                "INSERT INTO follow_up_rate_limits (user_id, last_sent_at, daily_count, reset_date)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                     daily_count = CASE WHEN follow_up_rate_limits.reset_date = excluded.reset_date
                                        THEN follow_up_rate_limits.daily_count + 1 ELSE 1 END,
                     last_sent_at = excluded.last_sent_at,
                     reset_date = excluded.reset_date",
                params![job.user_id, db::to_rfc3339(now), today.to_string()],
            )
            .ok();
        }
        self.metrics.followup_sent.fetch_add(1, Ordering::Relaxed);
        self.arm_next_stage(job, now);
    }

    fn arm_next_stage(&self, job: &FollowUpJob, now: DateTime<Utc>) {
        let (stage, at) = if job.stage >= STAGE_OFFSETS_HOURS.len() - 1 {
            // Terminal scripted stage reached: recurring maintenance.
            (
                MAINTENANCE_STAGE,
                now + ChronoDuration::hours(MAINTENANCE_INTERVAL_HOURS),
            )
        } else {
            let next = job.stage + 1;
            let anchor = job.context_snapshot.snapshot_at.unwrap_or(now);
            let at = anchor + ChronoDuration::hours(STAGE_OFFSETS_HOURS[next]);
            (next, if at <= now { self.next_valid_window(now) } else { at })
        };
        if self.insert_job(&job.user_id, stage, at, &job.context_snapshot) {
            self.metrics.followup_armed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_send_failure(&self, job: &FollowUpJob, err: &DispatchError, now: DateTime<Utc>) {
        let attempts = job.attempts + 1;
        let retry_at = now
            + ChronoDuration::milliseconds(crate::queue::backoff(attempts).as_millis() as i64);
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE follow_up_jobs SET status = 'failed', attempts = ?1, scheduled_for = ?2
             WHERE job_id = ?3",
            params![attempts as i64, db::to_rfc3339(retry_at), job.job_id],
        )
        .ok();
        if attempts >= MAX_SEND_ATTEMPTS {
            eprintln!(
                "⚠️ Follow-up u={} stage={} gave up after {attempts} attempts: {err}",
                job.user_id, job.stage
            );
        }
    }

    fn reschedule(&self, job: &FollowUpJob, to: DateTime<Utc>) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE follow_up_jobs SET scheduled_for = ?1 WHERE job_id = ?2",
            params![db::to_rfc3339(to), job.job_id],
        )
        .ok();
    }

    fn set_status(&self, job_id: &str, status: &str) {
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE follow_up_jobs SET status = ?1 WHERE job_id = ?2",
            params![status, job_id],
        )
        .ok();
    }

    /// Startup reconciliation: repair jobs orphaned mid-dispatch and push
    /// overdue pending jobs to the next eligible window.
    pub fn reconcile(&self) -> (usize, usize) {
        let now = Utc::now();
        let window = self.next_valid_window(now).max(now);
        let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
        let repaired = conn
            .execute(
                "UPDATE follow_up_jobs SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .unwrap_or(0);
        let promoted = conn
            .execute(
                "UPDATE follow_up_jobs SET scheduled_for = ?1
                 WHERE status = 'pending' AND scheduled_for < ?2",
                params![db::to_rfc3339(window), db::to_rfc3339(now)],
            )
            .unwrap_or(0);
        if repaired + promoted > 0 {
            eprintln!("♻️  Follow-up recovery: {repaired} repaired, {promoted} promoted");
        }
        (repaired, promoted)
    }
}

// --- civil-time window math ---

fn at_local_hour(tz: Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = date
        .and_hms_opt(hour, 0, 0)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap());
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        chrono::LocalResult::None => tz.from_utc_datetime(&naive).with_timezone(&Utc),
    }
}

/// Earliest instant at or after `from` that falls on an allowed weekday
/// inside `[start_hour, end_hour)` local time. Returns `from` itself when it
/// already qualifies.
pub fn next_window(
    from: DateTime<Utc>,
    tz: Tz,
    start_hour: u32,
    end_hour: u32,
    weekdays: &[u32],
) -> DateTime<Utc> {
    let local = from.with_timezone(&tz);
    let mut date = local.date_naive();
    for day in 0..15 {
        let weekday = date.weekday().num_days_from_monday();
        if weekdays.contains(&weekday) {
            if day == 0 {
                let hour = local.hour();
                if hour >= start_hour && hour < end_hour {
                    return from;
                }
                if hour < start_hour {
                    return at_local_hour(tz, date, start_hour);
                }
                // Past closing: roll to the next allowed day.
            } else {
                return at_local_hour(tz, date, start_hour);
            }
        }
        date = match date.succ_opt() {
            Some(d) => d,
            None => return from,
        };
    }
    from
}

// --- message rendering ---

struct Vars {
    time_reference: String,
    specific_products: String,
    budget_reference: String,
    questions_reference: String,
    objection_response: String,
    personalized_cta: String,
}

fn time_reference(snapshot_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = snapshot_at else {
        return String::new();
    };
    let hours = (now - at).num_hours();
    match hours {
        h if h < 2 => "hace una hora".to_string(),
        h if h < 24 => "hace unas horas".to_string(),
        h if h < 48 => "ayer".to_string(),
        h => format!("hace {} días", h / 24),
    }
}

fn build_vars(snap: &ContextSnapshot, now: DateTime<Utc>, _tz: Tz) -> Vars {
    let specific_products = if snap.last_products.is_empty() {
        String::new()
    } else {
        format!("como {}", snap.last_products.join(", "))
    };
    let budget_reference = snap
        .budget_mentioned
        .as_deref()
        .map(|b| format!("dentro del presupuesto de {b} que me comentaste"))
        .unwrap_or_default();
    let questions_reference = if snap.last_questions.is_empty() {
        String::new()
    } else {
        format!("sobre lo que me preguntaste de {}", snap.last_questions.join(", "))
    };
    let objection_response = if snap.objections.is_empty() {
        String::new()
    } else {
        "Si te quedó alguna duda pendiente, la vemos juntos sin compromiso.".to_string()
    };
    let personalized_cta = match snap.customer_type.as_deref() {
        Some("entrepreneur") => "¿Te armo una selección para arrancar tu emprendimiento?",
        Some("reseller") => "Tengo novedades con precios mayoristas, ¿te las paso?",
        Some("retail") => "¿Querés que te reserve algo antes de que se agote?",
        _ => "¿Seguimos la charla?",
    }
    .to_string();

    Vars {
        time_reference: time_reference(snap.snapshot_at, now),
        specific_products,
        budget_reference,
        questions_reference,
        objection_response,
        personalized_cta,
    }
}

fn pick_template(stage: usize, snap: &ContextSnapshot) -> &'static str {
    let engaged = snap.engagement_level == EngagementLevel::High;
    let has_objections = !snap.objections.is_empty();
    match stage {
        0 => {
            if engaged {
                "¡Hola! Hablamos {time_reference} y quedaste mirando algunos productos {specific_products}. ¿Te ayudo a decidir? {personalized_cta}"
            } else {
                "¡Hola! Te escribí {time_reference} y quedó la charla pendiente. ¿Seguís buscando algo? {personalized_cta}"
            }
        }
        1 | 2 => {
            if has_objections {
                "¡Hola! ¿Cómo estás? Me quedé pensando en tu consulta {questions_reference}. {objection_response} {personalized_cta}"
            } else {
                "¡Hola! ¿Cómo estás? Quería retomar la charla {questions_reference}. Tengo opciones nuevas {specific_products}. {personalized_cta}"
            }
        }
        3..=6 => {
            "¡Hola! Entraron productos nuevos que van con lo que buscabas {specific_products} {budget_reference}. {objection_response} {personalized_cta}"
        }
        7..=11 => {
            "¡Hola! Hace un tiempo charlamos y no quería que te pierdas las novedades. Hay promos vigentes {budget_reference}. {personalized_cta}"
        }
        12 => {
            "¡Hola! Este es mi último recordatorio, no quiero molestarte. Cuando quieras retomar, escribime y seguimos donde dejamos. ¡Gracias por tu tiempo!"
        }
        _ => {
            "¡Hola! Pasaba a contarte que tenemos novedades en la tienda. Si querés ver el catálogo actualizado, avisame. {personalized_cta}"
        }
    }
}

/// Render the outbound text for a stage from its snapshot. Unset variables
/// disappear; no placeholder ever reaches the user.
pub fn render_message(
    stage: usize,
    snap: &ContextSnapshot,
    now: DateTime<Utc>,
    tz: Tz,
) -> String {
    let vars = build_vars(snap, now, tz);
    let mut text = pick_template(stage, snap).to_string();
    for (key, value) in [
        ("{time_reference}", vars.time_reference.as_str()),
        ("{specific_products}", vars.specific_products.as_str()),
        ("{budget_reference}", vars.budget_reference.as_str()),
        ("{questions_reference}", vars.questions_reference.as_str()),
        ("{objection_response}", vars.objection_response.as_str()),
        ("{personalized_cta}", vars.personalized_cta.as_str()),
    ] {
        text = text.replace(key, value);
    }
    // Collapse the gaps empty variables leave behind.
    while text.contains("  ") {
        text = text.replace("  ", " ");
    }
    text.replace(" .", ".").replace(" ,", ",").trim().to_string()
}
