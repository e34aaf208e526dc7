use crate::errors::DispatchError;
use crate::pipeline::{IngestOutcome, Orchestrator};
use crate::transport;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{post, State};
use serde::Deserialize;
use std::sync::Arc;

use super::ClientIp;

fn outcome_body(outcome: IngestOutcome) -> Json<serde_json::Value> {
    match outcome {
        IngestOutcome::Accepted => Json(serde_json::json!({ "status": "accepted" })),
        IngestOutcome::Ignored { reason } => {
            Json(serde_json::json!({ "status": "ignored", "reason": reason }))
        }
    }
}

/// WhatsApp gateway webhook. Always 200: admission rejections ride in the
/// body so the gateway never retries.
#[post("/webhook/whatsapp", format = "json", data = "<body>")]
pub async fn webhook_whatsapp(
    orch: &State<Arc<Orchestrator>>,
    ip: ClientIp,
    body: Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let event = transport::parse_whatsapp(&body);
    outcome_body(orch.ingest(event, &ip.0).await)
}

/// Chatwoot webhook: chat messages, private notes and conversation updates
/// all arrive here and are routed by payload shape.
#[post("/webhook/chatwoot", format = "json", data = "<body>")]
pub async fn webhook_chatwoot(
    orch: &State<Arc<Orchestrator>>,
    ip: ClientIp,
    body: Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let event = transport::parse_chatwoot(&body);
    outcome_body(orch.ingest(event, &ip.0).await)
}

#[derive(Debug, Deserialize)]
pub struct TestMessage {
    pub user_id: String,
    pub message: String,
}

/// Synchronous test path: runs the agent inline and returns the reply,
/// skipping queue and outbound transports.
#[post("/test/message", format = "json", data = "<body>")]
pub async fn test_message(
    orch: &State<Arc<Orchestrator>>,
    body: Json<TestMessage>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let user_id = body.user_id.trim();
    let text = body.message.trim();
    if user_id.is_empty() || text.is_empty() {
        return Err((
            Status::BadRequest,
            Json(serde_json::json!({"error": "user_id and message are required"})),
        ));
    }
    match orch.handle_test_message(user_id, text).await {
        Ok(response) => Ok(Json(serde_json::json!({
            "user_id": user_id,
            "response": response,
        }))),
        Err(DispatchError::Paused) => Ok(Json(serde_json::json!({
            "user_id": user_id,
            "response": serde_json::Value::Null,
            "status": "paused",
        }))),
        Err(e) => Err((
            Status::InternalServerError,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}
