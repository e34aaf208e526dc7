use crate::pipeline::Orchestrator;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PAUSE_TTL_SECS: u64 = 24 * 3600;

// --- Bot state ---

#[get("/bot/status/<user_id>")]
pub fn bot_status(orch: &State<Arc<Orchestrator>>, user_id: &str) -> Json<serde_json::Value> {
    match orch.gate.get_state(user_id) {
        Some(state) => Json(serde_json::json!({
            "user_id": user_id,
            "paused": state.paused,
            "reason": state.reason,
            "set_by": state.set_by,
            "paused_at": state.paused_at.to_rfc3339(),
            "expires_at": state.expires_at.map(|t| t.to_rfc3339()),
        })),
        None => Json(serde_json::json!({
            "user_id": user_id,
            "paused": false,
        })),
    }
}

/// Operator pause; overrides force-active, unlike supervisory signals.
#[post("/bot/pause/<user_id>?<reason>&<ttl>")]
pub fn bot_pause(
    orch: &State<Arc<Orchestrator>>,
    user_id: &str,
    reason: Option<&str>,
    ttl: Option<u64>,
) -> Json<serde_json::Value> {
    let ttl = Duration::from_secs(ttl.unwrap_or(DEFAULT_PAUSE_TTL_SECS));
    orch.gate
        .pause(user_id, reason.unwrap_or("manual"), "operator", ttl);
    Json(serde_json::json!({ "user_id": user_id, "paused": true }))
}

#[post("/bot/resume/<user_id>")]
pub fn bot_resume(orch: &State<Arc<Orchestrator>>, user_id: &str) -> Json<serde_json::Value> {
    orch.gate.resume(user_id);
    Json(serde_json::json!({ "user_id": user_id, "paused": false }))
}

#[post("/bot/resume-all")]
pub fn bot_resume_all(orch: &State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    let resumed = orch.gate.resume_all();
    Json(serde_json::json!({ "resumed": resumed }))
}

// --- Follow-ups ---

#[post("/followup/activate/<user_id>")]
pub fn followup_activate(
    orch: &State<Arc<Orchestrator>>,
    user_id: &str,
) -> Json<serde_json::Value> {
    orch.followups.activate(user_id);
    Json(serde_json::json!({ "user_id": user_id, "active": true }))
}

#[post("/followup/deactivate/<user_id>?<reason>")]
pub fn followup_deactivate(
    orch: &State<Arc<Orchestrator>>,
    user_id: &str,
    reason: Option<&str>,
) -> Json<serde_json::Value> {
    orch.followups
        .deactivate(user_id, reason.unwrap_or("manual"));
    Json(serde_json::json!({ "user_id": user_id, "active": false }))
}

#[get("/followup/status/<user_id>")]
pub fn followup_status(
    orch: &State<Arc<Orchestrator>>,
    user_id: &str,
) -> Json<serde_json::Value> {
    Json(orch.followups.status(user_id))
}
