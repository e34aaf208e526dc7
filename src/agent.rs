use crate::config::Config;
use crate::errors::DispatchError;
use crate::models::{ConversationContext, TurnRole};
use std::time::Duration;

/// Narrow capability seam for the AI runtime. Workers and the test endpoint
/// only see this trait; the actual model call lives behind it.
#[rocket::async_trait]
pub trait ReplyEngine: Send + Sync {
    async fn infer_reply(
        &self,
        ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, DispatchError>;
}

const SYSTEM_PROMPT: &str = "Sos el asistente de ventas de la tienda. Respondé en español \
rioplatense, corto y amable. Si el cliente pregunta por productos, ayudalo a elegir.";

/// Chat-completions client with the conversation ring as rolling history.
pub struct HttpReplyEngine {
    client: reqwest::Client,
    config: Config,
}

impl HttpReplyEngine {
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.agent_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        HttpReplyEngine { client, config }
    }

    fn build_messages(ctx: &ConversationContext, text: &str) -> Vec<serde_json::Value> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": SYSTEM_PROMPT,
        })];
        if let Some(kind) = &ctx.profile.customer_type {
            messages.push(serde_json::json!({
                "role": "system",
                "content": format!("Perfil del cliente: {kind}, interés: {}",
                    ctx.profile.primary_interest.as_deref().unwrap_or("desconocido")),
            }));
        }
        for turn in &ctx.interaction_history {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
                TurnRole::System => "system",
            };
            messages.push(serde_json::json!({ "role": role, "content": turn.text }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": text }));
        messages
    }
}

#[rocket::async_trait]
impl ReplyEngine for HttpReplyEngine {
    async fn infer_reply(
        &self,
        ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, DispatchError> {
        let Some(api_key) = self.config.ai_api_key.as_deref() else {
            return Err(DispatchError::PermanentAgent("AI_API_KEY not set".into()));
        };
        let body = serde_json::json!({
            "model": self.config.ai_model,
            "messages": Self::build_messages(ctx, text),
        });

        let response = self
            .client
            .post(&self.config.ai_api_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::DeadlineExceeded(e.to_string())
                } else {
                    DispatchError::TransientAgent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DispatchError::TransientAgent(format!("HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(DispatchError::PermanentAgent(format!("HTTP {status}")));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DispatchError::TransientAgent(e.to_string()))?;
        let reply = parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DispatchError::TransientAgent("empty completion".into()))?;
        Ok(reply)
    }
}

/// Deterministic engine used when no API key is configured and by the test
/// suite: replies echo the inbound text.
pub struct EchoReplyEngine;

#[rocket::async_trait]
impl ReplyEngine for EchoReplyEngine {
    async fn infer_reply(
        &self,
        _ctx: &ConversationContext,
        text: &str,
    ) -> Result<String, DispatchError> {
        Ok(format!("Recibí tu mensaje: {text}"))
    }
}
