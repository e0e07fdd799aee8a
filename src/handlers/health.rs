use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub const ROOT_MESSAGE: &str = "Virtual photoshoot API is running!";

pub async fn root() -> Json<Value> {
    Json(json!({ "message": ROOT_MESSAGE }))
}

/// Liveness only. Model readiness is reported separately by `/readyz`.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.registry.get() {
        Some(registry) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "device": registry.device.to_string() })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "loading" })),
        ),
    }
}
