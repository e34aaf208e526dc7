use crate::models::InboundMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-user burst coalescing. Messages arriving inside the window pile up;
/// each new arrival pushes the deadline out, bounded by `max_wait` from the
/// first arrival so a chatty user still gets an answer.
pub struct BurstBuffer {
    pending: Mutex<HashMap<String, PendingBurst>>,
    window: Duration,
    max_wait: Duration,
}

struct PendingBurst {
    messages: Vec<InboundMessage>,
    first_at: Instant,
    deadline: Instant,
}

impl BurstBuffer {
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        BurstBuffer {
            pending: Mutex::new(HashMap::new()),
            window,
            max_wait,
        }
    }

    /// Buffer a message for its user. Arrival order within a user is the
    /// emission order; cross-user ordering is not tracked.
    pub fn enqueue(&self, msg: InboundMessage) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let user_id = msg.user_id.clone();
        let burst = pending.entry(user_id).or_insert_with(|| PendingBurst {
            messages: Vec::new(),
            first_at: now,
            deadline: now + self.window,
        });
        burst.messages.push(msg);
        let extended = now + self.window;
        let hard_cap = burst.first_at + self.max_wait;
        burst.deadline = extended.min(hard_cap);
    }

    /// Emit every burst whose deadline has passed, one coalesced message per
    /// user. Runs under a single lock, so a message is never split across
    /// two units.
    pub fn flush_due(&self, now: Instant) -> Vec<InboundMessage> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, b)| b.deadline <= now)
            .map(|(user, _)| user.clone())
            .collect();
        due.into_iter()
            .filter_map(|user| pending.remove(&user))
            .map(|burst| coalesce(burst.messages))
            .collect()
    }

    pub fn pending_users(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }
}

/// Merge a user's burst into a single message: texts joined with newlines,
/// earliest arrival time, latest transport message id.
fn coalesce(mut messages: Vec<InboundMessage>) -> InboundMessage {
    if messages.len() == 1 {
        return messages.pop().unwrap();
    }
    let text = messages
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let arrived_at = messages
        .iter()
        .map(|m| m.arrived_at)
        .min()
        .unwrap_or_else(chrono::Utc::now);
    let conversation_id = messages.iter().rev().find_map(|m| m.conversation_id.clone());
    let last = messages.pop().unwrap();
    InboundMessage {
        user_id: last.user_id,
        text,
        source: last.source,
        transport_message_id: last.transport_message_id,
        conversation_id,
        arrived_at,
        raw_metadata: last.raw_metadata,
    }
}
