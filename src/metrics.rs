use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Keep the last N agent latencies for percentile estimates.
const LATENCY_RING_CAP: usize = 256;

/// Process-wide counters and gauges, incremented at each pipeline event and
/// served as a JSON snapshot from `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub inbound_admitted: AtomicU64,
    pub inbound_rejected_dup: AtomicU64,
    pub inbound_rejected_rate: AtomicU64,
    pub inbound_rejected_bad: AtomicU64,
    pub inbound_rejected_busy: AtomicU64,

    pub queue_submitted_urgent: AtomicU64,
    pub queue_submitted_high: AtomicU64,
    pub queue_submitted_normal: AtomicU64,
    pub queue_submitted_low: AtomicU64,
    pub queue_leased: AtomicU64,

    pub acked_success: AtomicU64,
    pub acked_retry: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub paused_skips: AtomicU64,

    pub transport_sent: AtomicU64,
    pub transport_failed: AtomicU64,

    pub followup_armed: AtomicU64,
    pub followup_sent: AtomicU64,
    pub followup_skipped_guard: AtomicU64,
    pub followup_cancelled: AtomicU64,

    pub workers_current: AtomicUsize,
    pub workers_busy: AtomicUsize,

    agent_latencies_ms: Mutex<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queue_submitted(&self, priority: crate::models::Priority) {
        use crate::models::Priority;
        let counter = match priority {
            Priority::Urgent => &self.queue_submitted_urgent,
            Priority::High => &self.queue_submitted_high,
            Priority::Normal => &self.queue_submitted_normal,
            Priority::Low => &self.queue_submitted_low,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_latency(&self, ms: u64) {
        let mut ring = self
            .agent_latencies_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        ring.push_back(ms);
        while ring.len() > LATENCY_RING_CAP {
            ring.pop_front();
        }
    }

    /// (p50, p95) over the latency ring, in milliseconds.
    pub fn latency_percentiles(&self) -> (u64, u64) {
        let ring = self
            .agent_latencies_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if ring.is_empty() {
            return (0, 0);
        }
        let mut sorted: Vec<u64> = ring.iter().copied().collect();
        sorted.sort_unstable();
        let idx = |q: f64| -> u64 {
            let pos = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[pos.min(sorted.len() - 1)]
        };
        (idx(0.50), idx(0.95))
    }

    /// Busy workers over current workers, 0.0..1.0.
    pub fn utilization(&self) -> f64 {
        let current = self.workers_current.load(Ordering::Relaxed);
        if current == 0 {
            return 0.0;
        }
        self.workers_busy.load(Ordering::Relaxed) as f64 / current as f64
    }

    pub fn snapshot(&self, queue_depths: [usize; 4], in_flight: usize) -> serde_json::Value {
        let (p50, p95) = self.latency_percentiles();
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "inbound": {
                "admitted": get(&self.inbound_admitted),
                "rejected_duplicate": get(&self.inbound_rejected_dup),
                "rejected_rate_limited": get(&self.inbound_rejected_rate),
                "rejected_bad_request": get(&self.inbound_rejected_bad),
                "rejected_busy": get(&self.inbound_rejected_busy),
            },
            "queue": {
                "submitted": {
                    "urgent": get(&self.queue_submitted_urgent),
                    "high": get(&self.queue_submitted_high),
                    "normal": get(&self.queue_submitted_normal),
                    "low": get(&self.queue_submitted_low),
                },
                "leased": get(&self.queue_leased),
                "depth": {
                    "urgent": queue_depths[0],
                    "high": queue_depths[1],
                    "normal": queue_depths[2],
                    "low": queue_depths[3],
                    "total": queue_depths.iter().sum::<usize>(),
                },
                "in_flight": in_flight,
                "acked_success": get(&self.acked_success),
                "acked_retry": get(&self.acked_retry),
                "dead_lettered": get(&self.dead_lettered),
            },
            "workers": {
                "current": self.workers_current.load(Ordering::Relaxed),
                "busy": self.workers_busy.load(Ordering::Relaxed),
                "utilization": self.utilization(),
                "paused_skips": get(&self.paused_skips),
            },
            "agent": {
                "latency_p50_ms": p50,
                "latency_p95_ms": p95,
            },
            "transport": {
                "sent": get(&self.transport_sent),
                "failed": get(&self.transport_failed),
            },
            "followups": {
                "armed": get(&self.followup_armed),
                "sent": get(&self.followup_sent),
                "skipped_by_guard": get(&self.followup_skipped_guard),
                "cancelled": get(&self.followup_cancelled),
            },
        })
    }
}
