use crate::admission::{Admission, AdmitDecision};
use crate::agent::ReplyEngine;
use crate::breaker::CircuitBreaker;
use crate::burst::BurstBuffer;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::context::ContextStore;
use crate::db::Db;
use crate::errors::DispatchError;
use crate::followup::FollowupScheduler;
use crate::gate::BotGate;
use crate::metrics::Metrics;
use crate::models::{InboundEvent, InboundMessage, Priority, QueuedItem, Source, TurnRole};
use crate::queue::{AckOutcome, AckResult, PriorityQueue};
use crate::supervisor::{NoteAction, Supervisor};
use crate::transport::{self, TransportSender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUSY_REPLY: &str =
    "Estoy recibiendo muchos mensajes en este momento. Dame unos minutos y te respondo, ¡gracias!";

/// What a webhook handler reports back to the transport. Rejections still
/// travel as HTTP 200 so the transport never retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Ignored { reason: String },
}

/// Process-wide pipeline state, constructed once at startup and handed to
/// the HTTP layer and background loops. Owns every component from intake to
/// dispatch; the worker pool lives outside and calls back in.
pub struct Orchestrator {
    pub config: Config,
    pub db: Arc<Db>,
    pub cache: Arc<TtlCache>,
    pub metrics: Arc<Metrics>,
    pub admission: Admission,
    pub bursts: BurstBuffer,
    pub queue: PriorityQueue,
    pub contexts: Arc<ContextStore>,
    pub gate: Arc<BotGate>,
    pub supervisor: Supervisor,
    pub followups: Arc<FollowupScheduler>,
    pub sender: Arc<dyn TransportSender>,
    pub engine: Arc<dyn ReplyEngine>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        db: Arc<Db>,
        sender: Arc<dyn TransportSender>,
        engine: Arc<dyn ReplyEngine>,
    ) -> Arc<Self> {
        let cache = Arc::new(TtlCache::new());
        let metrics = Arc::new(Metrics::new());
        let contexts = Arc::new(ContextStore::new(&config, db.clone(), cache.clone()));
        let gate = Arc::new(BotGate::new(db.clone(), cache.clone()));
        let followups = Arc::new(FollowupScheduler::new(
            config.clone(),
            db.clone(),
            gate.clone(),
            contexts.clone(),
            sender.clone(),
            metrics.clone(),
        ));

        Arc::new(Orchestrator {
            admission: Admission::new(config.clone(), db.clone()),
            bursts: BurstBuffer::new(
                Duration::from_millis(config.coalesce_window_ms),
                Duration::from_millis(config.coalesce_max_wait_ms),
            ),
            queue: PriorityQueue::new(db.clone()),
            supervisor: Supervisor::new(gate.clone()),
            contexts,
            gate,
            followups,
            sender,
            engine,
            cache,
            metrics,
            config,
            db,
        })
    }

    /// Crash recovery, run once at liftoff before any loop starts.
    pub fn recover(&self) {
        self.queue.recover();
        self.followups.reconcile();
    }

    // --- ingress ---

    /// Route a parsed webhook event into the pipeline. The webhook handler
    /// returns 200 regardless; this outcome only fills the response body.
    pub async fn ingest(&self, event: InboundEvent, ip: &str) -> IngestOutcome {
        match event {
            InboundEvent::Message(msg) => self.ingest_message(msg, ip).await,
            InboundEvent::ConversationUpdate(update) => {
                if let Some(action) = self.supervisor.apply_update(&update) {
                    eprintln!("🎚️  Supervisory u={}: {action}", update.user_id);
                }
                IngestOutcome::Accepted
            }
            InboundEvent::PrivateNote(note) => {
                let action = self.supervisor.apply_note(&note);
                let courtesy = match &action {
                    NoteAction::Paused => Some(transport::PAUSED_NOTICE),
                    NoteAction::Resumed => Some(transport::RESUMED_NOTICE),
                    NoteAction::PauseBlocked => {
                        eprintln!(
                            "🎚️  Private-note pause ignored for u={} (force-active)",
                            note.user_id
                        );
                        None
                    }
                    NoteAction::Status { paused, reason } => {
                        eprintln!(
                            "🎚️  Bot status u={}: paused={paused} reason={:?}",
                            note.user_id, reason
                        );
                        None
                    }
                    NoteAction::Unrecognized => None,
                };
                if let Some(text) = courtesy {
                    let _ = self
                        .sender
                        .send(
                            &note.user_id,
                            text,
                            Source::Chatwoot,
                            note.conversation_id.as_deref(),
                        )
                        .await;
                }
                IngestOutcome::Accepted
            }
            InboundEvent::Ignored { reason } => {
                self.metrics
                    .inbound_rejected_bad
                    .fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Ignored { reason }
            }
        }
    }

    async fn ingest_message(&self, msg: InboundMessage, ip: &str) -> IngestOutcome {
        let vip = self.contexts.is_vip(&msg.user_id);
        let decision = self
            .admission
            .admit(&msg, ip, vip, self.queue.depth());
        match decision {
            AdmitDecision::Admitted => {
                self.metrics.inbound_admitted.fetch_add(1, Ordering::Relaxed);
                // Any user interaction rewinds the follow-up cadence.
                self.followups.on_inbound(&msg.user_id);
                self.bursts.enqueue(msg);
                IngestOutcome::Accepted
            }
            AdmitDecision::Duplicate => {
                self.metrics
                    .inbound_rejected_dup
                    .fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Ignored {
                    reason: "duplicate".to_string(),
                }
            }
            AdmitDecision::RateLimited { scope } => {
                self.metrics
                    .inbound_rejected_rate
                    .fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Ignored {
                    reason: format!("rate_limited:{scope}"),
                }
            }
            AdmitDecision::Busy => {
                self.metrics
                    .inbound_rejected_busy
                    .fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .sender
                    .send(
                        &msg.user_id,
                        BUSY_REPLY,
                        msg.source,
                        msg.conversation_id.as_deref(),
                    )
                    .await;
                IngestOutcome::Ignored {
                    reason: "busy".to_string(),
                }
            }
        }
    }

    /// Drain due bursts into the priority queue. Called by the sweeper loop.
    pub fn flush_bursts(&self) {
        for msg in self.bursts.flush_due(Instant::now()) {
            let vip = self.contexts.is_vip(&msg.user_id);
            let priority = Priority::classify(&msg.text, vip);
            if self.queue.submit(msg, priority).is_some() {
                self.metrics.record_queue_submitted(priority);
            }
        }
    }

    // --- worker body ---

    /// Full handling of one leased item: pause gate, agent call under the
    /// circuit breaker, context write, outbound dispatch, follow-up arming.
    pub async fn process_item(&self, item: &QueuedItem, breaker: &CircuitBreaker) {
        let user_id = &item.user_id;

        if self.gate.is_paused(user_id) {
            // A human owns this conversation; complete silently.
            self.metrics.paused_skips.fetch_add(1, Ordering::Relaxed);
            self.queue.ack(&item.queue_id, AckOutcome::Success);
            self.metrics.acked_success.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !breaker.allow() {
            self.ack_failure(item, DispatchError::CircuitOpen).await;
            return;
        }

        let ctx = self.contexts.get(user_id);
        let started = Instant::now();
        let reply = self.engine.infer_reply(&ctx, &item.message.text).await;
        self.metrics
            .record_agent_latency(started.elapsed().as_millis() as u64);

        let text = match reply {
            Ok(text) => {
                breaker.record_success();
                text
            }
            Err(err) => {
                if !matches!(err, DispatchError::CircuitOpen) {
                    breaker.record_failure();
                }
                self.ack_failure(item, err).await;
                return;
            }
        };

        let updated = self.contexts.update(user_id, |ctx| {
            if let Some(cid) = &item.message.conversation_id {
                ctx.conversation_ids
                    .insert(item.message.source.as_str().to_string(), cid.clone());
            }
            // Retries of the same item must not double-append.
            if ctx.last_processed_queue_id.as_deref() != Some(item.queue_id.as_str()) {
                ctx.push_turn(TurnRole::User, &item.message.text);
                ctx.push_turn(TurnRole::Assistant, &text);
                ctx.last_processed_queue_id = Some(item.queue_id.clone());
            }
            ctx.touch();
        });
        let ctx = match updated {
            Ok(ctx) => ctx,
            Err(err) => {
                self.ack_failure(item, err).await;
                return;
            }
        };

        let conversation_id = item
            .message
            .conversation_id
            .clone()
            .or_else(|| ctx.conversation_ids.get(item.message.source.as_str()).cloned());
        match self
            .sender
            .send(user_id, &text, item.message.source, conversation_id.as_deref())
            .await
        {
            Ok(()) => {
                self.metrics.transport_sent.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(&item.queue_id, AckOutcome::Success);
                self.metrics.acked_success.fetch_add(1, Ordering::Relaxed);
                self.followups.on_user_activity(user_id);
            }
            Err(err) => {
                self.metrics.transport_failed.fetch_add(1, Ordering::Relaxed);
                self.ack_failure(item, err).await;
            }
        }
    }

    async fn ack_failure(&self, item: &QueuedItem, err: DispatchError) {
        let outcome = if err.is_retriable() {
            AckOutcome::Retriable(err.to_string())
        } else {
            AckOutcome::Permanent(err.to_string())
        };
        match self.queue.ack(&item.queue_id, outcome) {
            Some(AckResult::Retried { attempts, delay }) => {
                self.metrics.acked_retry.fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "🔁 Item {} retry {attempts} in {}ms: {err}",
                    item.queue_id,
                    delay.as_millis()
                );
            }
            Some(AckResult::DeadLettered(dead)) => {
                self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                eprintln!("💀 Item {} dead-lettered: {err}", item.queue_id);
                // The user gets a fixed apology, never an error dump.
                let conversation_id = dead.message.conversation_id.clone().or_else(|| {
                    self.contexts
                        .get(&dead.user_id)
                        .conversation_ids
                        .get(dead.message.source.as_str())
                        .cloned()
                });
                let _ = self
                    .sender
                    .send(
                        &dead.user_id,
                        transport::APOLOGY_TEXT,
                        dead.message.source,
                        conversation_id.as_deref(),
                    )
                    .await;
            }
            _ => {}
        }
    }

    // --- synchronous test path ---

    /// `/test/message`: run the agent inline, bypassing queue and transports.
    pub async fn handle_test_message(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<String, DispatchError> {
        if self.gate.is_paused(user_id) {
            return Err(DispatchError::Paused);
        }
        let ctx = self.contexts.get(user_id);
        let reply = self.engine.infer_reply(&ctx, text).await?;
        self.contexts.update(user_id, |ctx| {
            ctx.conversation_ids
                .insert(Source::Test.as_str().to_string(), "test".to_string());
            ctx.push_turn(TurnRole::User, text);
            ctx.push_turn(TurnRole::Assistant, &reply);
            ctx.touch();
        })?;
        self.followups.on_user_activity(user_id);
        Ok(reply)
    }

    // --- health ---

    /// Component checks behind `GET /health`. Returns (healthy, detail).
    pub fn health(&self) -> (bool, serde_json::Value) {
        let store_ok = {
            let conn = self.db.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).is_ok()
        };
        let depth = self.queue.depth();
        let queue_ok = depth < self.config.queue_soft_cap;
        let workers = self.metrics.workers_current.load(Ordering::Relaxed);
        let workers_ok = workers >= 1;
        let healthy = store_ok && queue_ok && workers_ok;

        let detail = serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "store": { "available": store_ok },
            "cache": { "available": true, "entries": self.cache.len() },
            "queue": { "depth": depth, "soft_cap": self.config.queue_soft_cap, "ok": queue_ok },
            "workers": {
                "current": workers,
                "utilization": self.metrics.utilization(),
                "ok": workers_ok,
            },
            "bursts": { "pending_users": self.bursts.pending_users() },
        });
        (healthy, detail)
    }
}
