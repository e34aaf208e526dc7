use crate::breaker::CircuitBreaker;
use crate::pipeline::Orchestrator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Consecutive low-utilization windows required before scaling down.
const SCALE_DOWN_WINDOWS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleAction {
    Up,
    Down,
    Hold,
}

/// Pure scaling rule, separated from the loop for testing: up when the
/// queue outgrows the pool or latency degrades, down only after sustained
/// idleness.
pub(crate) fn decide_scale(
    depth: usize,
    current: usize,
    min: usize,
    max: usize,
    p95_ms: u64,
    target_ms: u64,
    utilization: f64,
    consecutive_low: u32,
) -> ScaleAction {
    if current < max && (depth > 2 * current || (p95_ms > target_ms && p95_ms > 0)) {
        return ScaleAction::Up;
    }
    if current > min && depth == 0 && utilization < 0.3 && consecutive_low >= SCALE_DOWN_WINDOWS {
        return ScaleAction::Down;
    }
    ScaleAction::Hold
}

struct WorkerHandle {
    id: String,
    stop_tx: watch::Sender<bool>,
}

/// Dynamic pool of `Nmin..Nmax` workers leasing from the priority queue.
/// A supervisor loop resizes it on queue depth and agent latency; shutdown
/// drains in-flight items before aborting.
pub struct WorkerPool {
    orch: Arc<Orchestrator>,
    breaker: Arc<CircuitBreaker>,
    workers: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(orch: Arc<Orchestrator>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        Arc::new(WorkerPool {
            orch,
            breaker,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            shutdown_tx,
        })
    }

    /// Spawn the minimum worker set and the scaling supervisor.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.orch.config.worker_pool_min {
            self.spawn_worker();
        }
        let pool = self.clone();
        tokio::spawn(async move { pool.scaling_loop().await });
        println!(
            "👷 Worker pool started: {}..{} workers",
            self.orch.config.worker_pool_min, self.orch.config.worker_pool_max
        );
    }

    pub fn current(&self) -> usize {
        self.orch.metrics.workers_current.load(Ordering::Relaxed)
    }

    fn spawn_worker(self: &Arc<Self>) {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{n}");
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.push(WorkerHandle {
                id: id.clone(),
                stop_tx,
            });
        }
        self.orch
            .metrics
            .workers_current
            .fetch_add(1, Ordering::Relaxed);
        let pool = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move { pool.worker_loop(id, stop_rx, shutdown_rx).await });
    }

    fn stop_one(&self) {
        let handle = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.pop()
        };
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            eprintln!("👷 Scaling down, stopping {}", handle.id);
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        id: String,
        mut stop_rx: watch::Receiver<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let orch = self.orch.clone();
        loop {
            if *stop_rx.borrow() || *shutdown_rx.borrow() {
                break;
            }
            match orch.queue.try_lease(&id) {
                Some(item) => {
                    orch.metrics.queue_leased.fetch_add(1, Ordering::Relaxed);
                    orch.metrics.workers_busy.fetch_add(1, Ordering::Relaxed);
                    orch.process_item(&item, &self.breaker).await;
                    orch.metrics.workers_busy.fetch_sub(1, Ordering::Relaxed);
                }
                None => {
                    // Sleep fallback wakes us for future-scheduled retries.
                    tokio::select! {
                        _ = orch.queue.notified() => {}
                        _ = stop_rx.changed() => {}
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
        orch.metrics.workers_current.fetch_sub(1, Ordering::Relaxed);
    }

    async fn scaling_loop(self: Arc<Self>) {
        let config = &self.orch.config;
        let interval = Duration::from_secs(config.scale_interval_secs.max(1));
        let cooldown = Duration::from_secs(config.scale_cooldown_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_low: u32 = 0;
        let mut last_scale = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            let depth = self.orch.queue.depth();
            let utilization = self.orch.metrics.utilization();
            let (_, p95) = self.orch.metrics.latency_percentiles();
            if depth == 0 && utilization < 0.3 {
                consecutive_low += 1;
            } else {
                consecutive_low = 0;
            }

            if last_scale.elapsed() < cooldown {
                continue;
            }
            match decide_scale(
                depth,
                self.current(),
                config.worker_pool_min,
                config.worker_pool_max,
                p95,
                config.target_latency_ms,
                utilization,
                consecutive_low,
            ) {
                ScaleAction::Up => {
                    self.spawn_worker();
                    last_scale = Instant::now();
                    eprintln!(
                        "👷 Scaling up to {} (depth={depth}, p95={p95}ms)",
                        self.current()
                    );
                }
                ScaleAction::Down => {
                    self.stop_one();
                    last_scale = Instant::now();
                    consecutive_low = 0;
                }
                ScaleAction::Hold => {}
            }
        }
    }

    /// Stop leasing and wait up to `timeout` for in-flight items; pending
    /// work stays durable for the next process instance.
    pub async fn drain(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.orch.metrics.workers_busy.load(Ordering::Relaxed) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        println!("👷 Worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_on_queue_depth() {
        assert_eq!(
            decide_scale(10, 2, 2, 8, 0, 10_000, 1.0, 0),
            ScaleAction::Up
        );
    }

    #[test]
    fn test_scale_up_on_latency() {
        assert_eq!(
            decide_scale(1, 4, 2, 8, 15_000, 10_000, 0.5, 0),
            ScaleAction::Up
        );
    }

    #[test]
    fn test_no_scale_past_max() {
        assert_eq!(
            decide_scale(100, 8, 2, 8, 20_000, 10_000, 1.0, 0),
            ScaleAction::Hold
        );
    }

    #[test]
    fn test_scale_down_needs_three_low_windows() {
        assert_eq!(decide_scale(0, 4, 2, 8, 0, 10_000, 0.0, 2), ScaleAction::Hold);
        assert_eq!(decide_scale(0, 4, 2, 8, 0, 10_000, 0.0, 3), ScaleAction::Down);
    }

    #[test]
    fn test_no_scale_below_min() {
        assert_eq!(decide_scale(0, 2, 2, 8, 0, 10_000, 0.0, 10), ScaleAction::Hold);
    }

    #[test]
    fn test_busy_pool_holds() {
        assert_eq!(decide_scale(3, 4, 2, 8, 500, 10_000, 0.8, 0), ScaleAction::Hold);
    }
}
