use crate::pipeline::Orchestrator;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{get, State};
use std::sync::Arc;

/// Aggregated component health: 200 when the core pipeline is serviceable,
/// 503 otherwise.
#[get("/health")]
pub fn health(orch: &State<Arc<Orchestrator>>) -> Custom<Json<serde_json::Value>> {
    let (healthy, detail) = orch.health();
    let status = if healthy {
        Status::Ok
    } else {
        Status::ServiceUnavailable
    };
    Custom(status, Json(detail))
}

/// JSON metrics snapshot: counters, queue depths, worker gauges, latency
/// percentiles.
#[get("/metrics")]
pub fn metrics(orch: &State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(orch.metrics.snapshot(
        orch.queue.depth_by_priority(),
        orch.queue.in_flight(),
    ))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
