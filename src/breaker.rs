use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker around the agent call. Trips after a run of consecutive
/// failures, stays open for a cooldown, then lets a single probe through.
pub struct CircuitBreaker {
    state: Mutex<State>,
    threshold: u32,
    cooldown: Duration,
}

#[derive(Debug, Clone)]
enum State {
    /// Normal operation; counts the current run of consecutive failures.
    Closed { consecutive_failures: u32 },
    /// Tripped; all calls are rejected until the cooldown elapses.
    Open { tripped_at: Instant },
    /// Cooldown elapsed; exactly one probe call is allowed.
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen once the
    /// cooldown has elapsed, admitting a single probe.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } => true,
            State::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    eprintln!("⚡ Circuit half-open, allowing probe call");
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight; hold everyone else back.
            State::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(&*state, State::HalfOpen) {
            eprintln!("⚡ Circuit closed (probe succeeded)");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.threshold {
                    eprintln!(
                        "⚡ Circuit tripped after {} consecutive failures, open for {}s",
                        consecutive_failures,
                        self.cooldown.as_secs()
                    );
                    *state = State::Open {
                        tripped_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen => {
                eprintln!("⚡ Half-open probe failed, circuit re-tripped");
                *state = State::Open {
                    tripped_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(&*state, State::Open { .. })
    }
}
