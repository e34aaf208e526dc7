use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Interaction history ring capacity per user.
pub const HISTORY_CAP: usize = 20;
/// Recent products ring capacity per user.
pub const PRODUCTS_CAP: usize = 10;

// --- Inbound ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Whatsapp,
    Chatwoot,
    Test,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Whatsapp => "whatsapp",
            Source::Chatwoot => "chatwoot",
            Source::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s {
            "whatsapp" => Some(Source::Whatsapp),
            "chatwoot" => Some(Source::Chatwoot),
            "test" => Some(Source::Test),
            _ => None,
        }
    }
}

/// Canonical intake record. Immutable after construction; bursts are
/// coalesced into a fresh one rather than mutated in place.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InboundMessage {
    pub user_id: String,
    pub text: String,
    pub source: Source,
    pub transport_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub arrived_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_metadata: serde_json::Value,
}

impl InboundMessage {
    /// Dedup key: sha256 over `userId:text`, hex-encoded.
    pub fn message_hash(&self) -> String {
        message_hash(&self.user_id, &self.text)
    }
}

pub fn message_hash(user_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Tagged inbound variant produced by the transport adapters. Downstream
/// code pattern-matches instead of sniffing raw payloads.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(InboundMessage),
    ConversationUpdate(ConversationUpdate),
    PrivateNote(PrivateNote),
    Ignored { reason: String },
}

/// Supervisory state extracted from a Chatwoot `conversation_updated` event.
#[derive(Debug, Clone)]
pub struct ConversationUpdate {
    pub user_id: String,
    pub conversation_id: Option<String>,
    /// Union of labels found across the payload's label locations.
    pub labels: BTreeSet<String>,
    /// True when at least one label location was present in the payload.
    pub labels_known: bool,
    pub status: Option<String>,
    pub assignee_id: Option<String>,
    /// True when the payload carried assignee information at all.
    pub assignee_known: bool,
}

#[derive(Debug, Clone)]
pub struct PrivateNote {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
}

// --- Priority queue ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s {
            "urgent" => Some(Priority::Urgent),
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    /// Urgency from message content and sender standing.
    pub fn classify(text: &str, vip: bool) -> Priority {
        if vip {
            return Priority::Urgent;
        }
        let lowered = text.to_lowercase();
        const HOT_WORDS: [&str; 4] = ["urgente", "urgent", "problema", "reclamo"];
        if HOT_WORDS.iter().any(|w| lowered.contains(w)) {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::DeadLetter => "dead_letter",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueuedItem {
    pub queue_id: String,
    pub user_id: String,
    pub message: InboundMessage,
    pub priority: Priority,
    pub status: ItemStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedItem {
    pub fn new(message: InboundMessage, priority: Priority) -> Self {
        let now = Utc::now();
        QueuedItem {
            queue_id: uuid::Uuid::new_v4().to_string(),
            user_id: message.user_id.clone(),
            message,
            priority,
            status: ItemStatus::Pending,
            attempts: 0,
            worker_id: None,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

// --- Conversation context ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngagementLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl EngagementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementLevel::Low => "low",
            EngagementLevel::Medium => "medium",
            EngagementLevel::High => "high",
        }
    }
}

/// Customer profile inferred over the conversation. Known keys are typed;
/// anything else the agent learns lands in `extra`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_interest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_mentioned: Option<String>,
    #[serde(default)]
    pub specific_products_mentioned: Vec<String>,
    #[serde(default)]
    pub objections_raised: Vec<String>,
    #[serde(default)]
    pub questions_asked: Vec<String>,
    #[serde(default)]
    pub engagement_level: EngagementLevel,
    #[serde(default)]
    pub vip: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProductRef {
    pub name: String,
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub shown_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    #[default]
    Browsing,
    Selecting,
    Purchasing,
    Escalated,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Browsing => "browsing",
            ConversationState::Selecting => "selecting",
            ConversationState::Purchasing => "purchasing",
            ConversationState::Escalated => "escalated",
        }
    }

    pub fn parse(s: &str) -> ConversationState {
        match s {
            "selecting" => ConversationState::Selecting,
            "purchasing" => ConversationState::Purchasing,
            "escalated" => ConversationState::Escalated,
            _ => ConversationState::Browsing,
        }
    }
}

/// Per-user conversation memory. Rings are bounded FIFO: append at the tail,
/// drop from the head on overflow, never reorder.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationContext {
    pub user_id: String,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub recent_products: VecDeque<ProductRef>,
    #[serde(default)]
    pub interaction_history: VecDeque<Turn>,
    #[serde(default)]
    pub state: ConversationState,
    /// Latest conversation id seen per transport, for outbound routing.
    #[serde(default)]
    pub conversation_ids: BTreeMap<String, String>,
    /// Queue id of the last item whose turns were appended; retried items
    /// must not double-append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_queue_id: Option<String>,
    pub conversation_started: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

impl ConversationContext {
    pub fn fresh(user_id: &str) -> Self {
        let now = Utc::now();
        ConversationContext {
            user_id: user_id.to_string(),
            profile: Profile::default(),
            recent_products: VecDeque::new(),
            interaction_history: VecDeque::new(),
            state: ConversationState::Browsing,
            conversation_ids: BTreeMap::new(),
            last_processed_queue_id: None,
            conversation_started: now,
            last_interaction: now,
        }
    }

    pub fn push_turn(&mut self, role: TurnRole, text: &str) {
        self.interaction_history.push_back(Turn {
            role,
            text: text.to_string(),
            at: Utc::now(),
        });
        while self.interaction_history.len() > HISTORY_CAP {
            self.interaction_history.pop_front();
        }
    }

    pub fn push_product(&mut self, product: ProductRef) {
        self.recent_products.push_back(product);
        while self.recent_products.len() > PRODUCTS_CAP {
            self.recent_products.pop_front();
        }
    }

    pub fn touch(&mut self) {
        self.last_interaction = Utc::now();
    }
}

// --- Bot state ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BotState {
    pub user_id: String,
    pub paused: bool,
    pub reason: String,
    pub set_by: String,
    pub paused_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BotState {
    /// An expired pause record is treated the same as no record at all.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }
}

// --- Follow-ups ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Processing,
    Sent,
    Cancelled,
    Failed,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Processing => "processing",
            FollowUpStatus::Sent => "sent",
            FollowUpStatus::Cancelled => "cancelled",
            FollowUpStatus::Failed => "failed",
        }
    }
}

/// Context slice captured when a follow-up sequence is armed. Rendering reads
/// from this snapshot, never from the live context.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContextSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<String>,
    #[serde(default)]
    pub engagement_level: EngagementLevel,
    #[serde(default)]
    pub last_products: Vec<String>,
    #[serde(default)]
    pub last_questions: Vec<String>,
    #[serde(default)]
    pub objections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_mentioned: Option<String>,
    #[serde(default)]
    pub snapshot_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn capture(ctx: &ConversationContext) -> Self {
        ContextSnapshot {
            customer_type: ctx.profile.customer_type.clone(),
            engagement_level: ctx.profile.engagement_level,
            last_products: ctx
                .recent_products
                .iter()
                .rev()
                .take(3)
                .map(|p| p.name.clone())
                .collect(),
            last_questions: ctx
                .profile
                .questions_asked
                .iter()
                .rev()
                .take(3)
                .cloned()
                .collect(),
            objections: ctx.profile.objections_raised.clone(),
            budget_mentioned: ctx.profile.budget_mentioned.clone(),
            snapshot_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FollowUpJob {
    pub job_id: String,
    pub user_id: String,
    pub stage: usize,
    pub scheduled_for: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub attempts: u32,
    pub context_snapshot: ContextSnapshot,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_hash_is_stable_and_user_scoped() {
        let a = message_hash("5493511111111", "hola");
        let b = message_hash("5493511111111", "hola");
        let c = message_hash("5493512222222", "hola");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_priority_classify() {
        assert_eq!(Priority::classify("hola", false), Priority::Normal);
        assert_eq!(Priority::classify("tengo un PROBLEMA", false), Priority::High);
        assert_eq!(Priority::classify("es urgente!", false), Priority::High);
        assert_eq!(Priority::classify("quiero hacer un reclamo", false), Priority::High);
        assert_eq!(Priority::classify("hola", true), Priority::Urgent);
    }

    #[test]
    fn test_history_ring_caps_at_twenty_fifo() {
        let mut ctx = ConversationContext::fresh("u1");
        for i in 0..25 {
            ctx.push_turn(TurnRole::User, &format!("m{i}"));
        }
        assert_eq!(ctx.interaction_history.len(), HISTORY_CAP);
        assert_eq!(ctx.interaction_history.front().unwrap().text, "m5");
        assert_eq!(ctx.interaction_history.back().unwrap().text, "m24");
    }

    #[test]
    fn test_products_ring_caps_at_ten() {
        let mut ctx = ConversationContext::fresh("u1");
        for i in 0..12 {
            ctx.push_product(ProductRef {
                name: format!("anillo {i}"),
                price: "1000".to_string(),
                id: None,
                url: None,
                category: None,
                shown_at: Utc::now(),
            });
        }
        assert_eq!(ctx.recent_products.len(), PRODUCTS_CAP);
        assert_eq!(ctx.recent_products.front().unwrap().name, "anillo 2");
    }

    #[test]
    fn test_context_serde_round_trip() {
        let mut ctx = ConversationContext::fresh("5493511234567");
        ctx.profile.customer_type = Some("reseller".to_string());
        ctx.profile.engagement_level = EngagementLevel::High;
        ctx.push_turn(TurnRole::User, "tenes anillos?");
        ctx.push_turn(TurnRole::Assistant, "si, mira estos");
        let json = serde_json::to_string(&ctx).unwrap();
        let back: ConversationContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, ctx.user_id);
        assert_eq!(back.interaction_history.len(), 2);
        assert_eq!(back.profile.customer_type.as_deref(), Some("reseller"));
        assert_eq!(back.state, ConversationState::Browsing);
    }

    #[test]
    fn test_bot_state_expiry() {
        let state = BotState {
            user_id: "u1".to_string(),
            paused: true,
            reason: "tag".to_string(),
            set_by: "agent".to_string(),
            paused_at: Utc::now() - chrono::Duration::hours(25),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        assert!(state.is_expired(Utc::now()));
    }
}
