use crate::gate::BotGate;
use crate::models::{ConversationUpdate, PrivateNote};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Tag names a human agent can put on a conversation.
pub const TAG_BOT_ACTIVE: &str = "bot-active";
pub const TAG_BOT_PAUSED: &str = "bot-paused";

const SUPERVISORY_TTL: Duration = Duration::from_secs(24 * 3600);

/// What a private-note command resolved to; the caller decides whether a
/// courtesy message goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteAction {
    Paused,
    /// Pause command ignored: the user is pinned force-active.
    PauseBlocked,
    Resumed,
    Status { paused: bool, reason: Option<String> },
    Unrecognized,
}

/// Interprets Chatwoot supervisory signals (tags, status, assignee, private
/// notes) and drives the bot-state gate. Signal priority is fixed: tags
/// beat status beats assignee; the first matching rule wins per event.
pub struct Supervisor {
    gate: Arc<BotGate>,
    note_re: Regex,
}

impl Supervisor {
    pub fn new(gate: Arc<BotGate>) -> Self {
        Supervisor {
            gate,
            note_re: Regex::new(r"(?i)^\s*/?bot\s+(pause|resume|status)\b")
                .expect("invalid note command regex"),
        }
    }

    /// Apply a conversation update. Returns a short action name for logging,
    /// or `None` when no rule fired.
    pub fn apply_update(&self, update: &ConversationUpdate) -> Option<&'static str> {
        let user = &update.user_id;

        if update.labels_known {
            if update.labels.contains(TAG_BOT_ACTIVE) {
                self.gate.force_activate(user, "agent");
                return Some("force-activate");
            }
            if update.labels.contains(TAG_BOT_PAUSED) {
                if self.gate.pause_supervisory(user, "tag", "agent", SUPERVISORY_TTL) {
                    return Some("pause-by-tag");
                }
                return Some("pause-blocked-by-force-active");
            }
        }

        if let Some(status) = update.status.as_deref() {
            match status {
                "resolved" | "closed" => {
                    if self.gate.pause_supervisory(
                        user,
                        "conversation-resolved",
                        "system",
                        SUPERVISORY_TTL,
                    ) {
                        return Some("pause-resolved");
                    }
                    return Some("pause-blocked-by-force-active");
                }
                "open" | "pending" => {
                    if self.gate.resume_if_reason(user, "conversation-resolved") {
                        return Some("resume-reopened");
                    }
                }
                _ => {}
            }
        }

        if update.assignee_known {
            match &update.assignee_id {
                Some(_) => {
                    if self.gate.pause_supervisory(
                        user,
                        "agent-assigned",
                        "system",
                        SUPERVISORY_TTL,
                    ) {
                        return Some("pause-assigned");
                    }
                    return Some("pause-blocked-by-force-active");
                }
                None => {
                    if self.gate.resume_if_reason(user, "agent-assigned") {
                        return Some("resume-unassigned");
                    }
                }
            }
        }

        None
    }

    /// Parse and apply a private-note command. Unknown commands are no-ops.
    pub fn apply_note(&self, note: &PrivateNote) -> NoteAction {
        let Some(caps) = self.note_re.captures(&note.text) else {
            return NoteAction::Unrecognized;
        };
        match caps[1].to_lowercase().as_str() {
            "pause" => {
                // Notes arrive through the transport, so this is a
                // supervisory signal: force-active wins over it.
                if self.gate.pause_supervisory(
                    &note.user_id,
                    "private-note",
                    "agent",
                    SUPERVISORY_TTL,
                ) {
                    NoteAction::Paused
                } else {
                    NoteAction::PauseBlocked
                }
            }
            "resume" => {
                self.gate.resume(&note.user_id);
                NoteAction::Resumed
            }
            "status" => {
                let state = self.gate.get_state(&note.user_id);
                NoteAction::Status {
                    paused: state.as_ref().map(|s| s.paused).unwrap_or(false),
                    reason: state.filter(|s| s.paused).map(|s| s.reason),
                }
            }
            _ => NoteAction::Unrecognized,
        }
    }
}
