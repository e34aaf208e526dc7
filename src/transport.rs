use crate::config::Config;
use crate::errors::DispatchError;
use crate::models::{
    ConversationUpdate, InboundEvent, InboundMessage, PrivateNote, Source,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// Fixed apology sent when an item dead-letters.
pub const APOLOGY_TEXT: &str =
    "Disculpá, estoy experimentando dificultades técnicas. Un asesor te va a responder a la brevedad.";

/// Courtesy notices for private-note bot commands.
pub const PAUSED_NOTICE: &str =
    "Un asesor del equipo va a continuar esta conversación. ¡Gracias por tu paciencia!";
pub const RESUMED_NOTICE: &str =
    "¡Listo! Sigo por acá para ayudarte con lo que necesites.";

const SEND_ATTEMPTS: u32 = 3;

// --- Inbound parsing ---

fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// WhatsApp JIDs look like `5493511234567@s.whatsapp.net`; the user id is
/// the digit run before the `@`.
fn user_from_jid(jid: &str) -> Option<String> {
    let head = jid.split('@').next()?;
    let id = digits(head);
    if id.is_empty() { None } else { Some(id) }
}

/// Parse a WhatsApp-gateway webhook body into the canonical tagged event.
pub fn parse_whatsapp(raw: &serde_json::Value) -> InboundEvent {
    let data = &raw["data"];
    if data["key"]["fromMe"].as_bool() == Some(true) {
        return InboundEvent::Ignored {
            reason: "own message".to_string(),
        };
    }
    let Some(user_id) = data["key"]["remoteJid"].as_str().and_then(user_from_jid) else {
        return InboundEvent::Ignored {
            reason: "missing user id".to_string(),
        };
    };
    let text = data["message"]["conversation"]
        .as_str()
        .unwrap_or("")
        .trim()
        .to_string();
    if text.is_empty() {
        return InboundEvent::Ignored {
            reason: "empty text".to_string(),
        };
    }
    let transport_message_id = data["key"]["id"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    InboundEvent::Message(InboundMessage {
        user_id,
        text,
        source: Source::Whatsapp,
        transport_message_id,
        conversation_id: None,
        arrived_at: Utc::now(),
        raw_metadata: raw.clone(),
    })
}

/// Chatwoot sends both chat traffic (`message_created`) and supervisory
/// state (`conversation_updated`) down the same webhook.
pub fn parse_chatwoot(raw: &serde_json::Value) -> InboundEvent {
    match raw["event"].as_str() {
        Some("message_created") => parse_chatwoot_message(raw),
        Some("conversation_updated") => parse_chatwoot_update(raw),
        Some(other) => InboundEvent::Ignored {
            reason: format!("unhandled event {other}"),
        },
        None => InboundEvent::Ignored {
            reason: "missing event type".to_string(),
        },
    }
}

fn chatwoot_user_id(raw: &serde_json::Value) -> Option<String> {
    let candidates = [
        &raw["sender"]["phone_number"],
        &raw["sender"]["identifier"],
        &raw["conversation"]["meta"]["sender"]["phone_number"],
        &raw["conversation"]["meta"]["sender"]["identifier"],
        &raw["meta"]["sender"]["phone_number"],
        &raw["meta"]["sender"]["identifier"],
    ];
    for candidate in candidates {
        if let Some(s) = candidate.as_str() {
            let id = digits(s);
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

fn chatwoot_conversation_id(raw: &serde_json::Value) -> Option<String> {
    for candidate in [&raw["conversation"]["id"], &raw["id"]] {
        if let Some(n) = candidate.as_i64() {
            return Some(n.to_string());
        }
        if let Some(s) = candidate.as_str() {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_chatwoot_message(raw: &serde_json::Value) -> InboundEvent {
    let Some(user_id) = chatwoot_user_id(raw) else {
        return InboundEvent::Ignored {
            reason: "missing user id".to_string(),
        };
    };
    let conversation_id = chatwoot_conversation_id(raw);
    let text = raw["content"].as_str().unwrap_or("").trim().to_string();
    if text.is_empty() {
        return InboundEvent::Ignored {
            reason: "empty text".to_string(),
        };
    }

    if raw["private"].as_bool() == Some(true) {
        return InboundEvent::PrivateNote(PrivateNote {
            user_id,
            conversation_id,
            text,
        });
    }

    let incoming = match &raw["message_type"] {
        v if v.as_str() == Some("incoming") => true,
        v if v.as_i64() == Some(0) => true,
        _ => false,
    };
    if !incoming {
        return InboundEvent::Ignored {
            reason: "not an incoming message".to_string(),
        };
    }

    let transport_message_id = raw["id"]
        .as_i64()
        .map(|n| n.to_string())
        .or_else(|| raw["id"].as_str().map(String::from))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    InboundEvent::Message(InboundMessage {
        user_id,
        text,
        source: Source::Chatwoot,
        transport_message_id,
        conversation_id,
        arrived_at: Utc::now(),
        raw_metadata: raw.clone(),
    })
}

/// Labels can appear as the current label set, inside the
/// `changed_attributes` delta, or under `meta`; all locations are folded
/// into one set before any rule runs.
fn collect_labels(raw: &serde_json::Value) -> (BTreeSet<String>, bool) {
    let mut labels = BTreeSet::new();
    let mut known = false;

    if let Some(arr) = raw["labels"].as_array() {
        known = true;
        for label in arr.iter().filter_map(|v| v.as_str()) {
            labels.insert(label.to_string());
        }
    }
    if let Some(changes) = raw["changed_attributes"].as_array() {
        for change in changes {
            if let Some(arr) = change["labels"]["current_value"].as_array() {
                known = true;
                for label in arr.iter().filter_map(|v| v.as_str()) {
                    labels.insert(label.to_string());
                }
            }
        }
    }
    if let Some(arr) = raw["meta"]["labels"].as_array() {
        known = true;
        for label in arr.iter().filter_map(|v| v.as_str()) {
            labels.insert(label.to_string());
        }
    }

    (labels, known)
}

fn parse_chatwoot_update(raw: &serde_json::Value) -> InboundEvent {
    let Some(user_id) = chatwoot_user_id(raw) else {
        return InboundEvent::Ignored {
            reason: "missing user id".to_string(),
        };
    };
    let (labels, labels_known) = collect_labels(raw);

    let assignee_known = raw["meta"].get("assignee").is_some()
        || raw["changed_attributes"]
            .as_array()
            .map(|arr| arr.iter().any(|c| c.get("assignee_id").is_some()))
            .unwrap_or(false);
    let assignee_id = raw["meta"]["assignee"]["id"]
        .as_i64()
        .map(|n| n.to_string())
        .or_else(|| {
            raw["changed_attributes"].as_array().and_then(|arr| {
                arr.iter()
                    .find_map(|c| c["assignee_id"]["current_value"].as_i64())
                    .map(|n| n.to_string())
            })
        });

    InboundEvent::ConversationUpdate(ConversationUpdate {
        user_id,
        conversation_id: chatwoot_conversation_id(raw),
        labels,
        labels_known,
        status: raw["status"].as_str().map(String::from),
        assignee_id,
        assignee_known,
    })
}

// --- Outbound ---

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub user_id: String,
    pub text: String,
    pub source: Source,
    pub conversation_id: Option<String>,
}

/// Narrow outbound capability handed to workers and the follow-up scheduler.
#[rocket::async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(
        &self,
        user_id: &str,
        text: &str,
        source: Source,
        conversation_id: Option<&str>,
    ) -> Result<(), DispatchError>;
}

/// Production sender hitting the WhatsApp gateway / Chatwoot REST APIs.
/// Retries 3× with exponential backoff on 5xx and timeouts; 4xx is terminal.
pub struct HttpTransportSender {
    client: reqwest::Client,
    config: Config,
}

impl HttpTransportSender {
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.transport_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        HttpTransportSender { client, config }
    }

    fn build_request(
        &self,
        user_id: &str,
        text: &str,
        source: Source,
        conversation_id: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, DispatchError> {
        match source {
            Source::Whatsapp => {
                let base = self.config.whatsapp_base_url.as_deref().ok_or_else(|| {
                    DispatchError::PermanentTransport("whatsapp gateway not configured".into())
                })?;
                let url = format!(
                    "{}/message/sendText/{}",
                    base.trim_end_matches('/'),
                    self.config.whatsapp_instance
                );
                Ok(self
                    .client
                    .post(url)
                    .header("apikey", &self.config.whatsapp_api_key)
                    .json(&serde_json::json!({
                        "number": user_id,
                        "textMessage": { "text": text }
                    })))
            }
            Source::Chatwoot => {
                let base = self.config.chatwoot_base_url.as_deref().ok_or_else(|| {
                    DispatchError::PermanentTransport("chatwoot not configured".into())
                })?;
                let cid = conversation_id.ok_or_else(|| {
                    DispatchError::PermanentTransport("no conversation id for chatwoot send".into())
                })?;
                let url = format!(
                    "{}/api/v1/accounts/{}/conversations/{}/messages",
                    base.trim_end_matches('/'),
                    self.config.chatwoot_account_id,
                    cid
                );
                Ok(self
                    .client
                    .post(url)
                    .header("api_access_token", &self.config.chatwoot_api_token)
                    .json(&serde_json::json!({
                        "content": text,
                        "message_type": "outgoing"
                    })))
            }
            Source::Test => Err(DispatchError::PermanentTransport(
                "test source has no HTTP transport".into(),
            )),
        }
    }
}

#[rocket::async_trait]
impl TransportSender for HttpTransportSender {
    async fn send(
        &self,
        user_id: &str,
        text: &str,
        source: Source,
        conversation_id: Option<&str>,
    ) -> Result<(), DispatchError> {
        if source == Source::Test {
            // Test traffic never leaves the process.
            return Ok(());
        }
        let mut last_err =
            DispatchError::TransientTransport("send not attempted".to_string());
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(crate::queue::backoff(attempt)).await;
            }
            let request = self.build_request(user_id, text, source, conversation_id)?;
            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    return Err(DispatchError::PermanentTransport(format!(
                        "HTTP {}",
                        resp.status()
                    )));
                }
                Ok(resp) => {
                    last_err =
                        DispatchError::TransientTransport(format!("HTTP {}", resp.status()));
                }
                Err(e) if e.is_timeout() => {
                    last_err = DispatchError::DeadlineExceeded(e.to_string());
                }
                Err(e) => {
                    last_err = DispatchError::TransientTransport(e.to_string());
                }
            }
        }
        Err(last_err)
    }
}

/// In-memory sender used by `/test/message` deployments and the integration
/// tests: every send lands in an inspectable outbox.
#[derive(Default)]
pub struct RecordingTransportSender {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingTransportSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[rocket::async_trait]
impl TransportSender for RecordingTransportSender {
    async fn send(
        &self,
        user_id: &str,
        text: &str,
        source: Source,
        conversation_id: Option<&str>,
    ) -> Result<(), DispatchError> {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(SentMessage {
            user_id: user_id.to_string(),
            text: text.to_string(),
            source,
            conversation_id: conversation_id.map(String::from),
        });
        Ok(())
    }
}
