use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::backend::metrics::MODEL_SWITCHES;
use crate::backend::state::AppState;
use crate::models::SetModelRequest;

pub async fn models_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .installed
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();
    Json(json!({
        "models": models,
        "current": state.current_model()
    }))
}

pub async fn set_model_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SetModelRequest>,
) -> (StatusCode, Json<Value>) {
    if !state.select_model(&payload.model) {
        tracing::warn!(model = %payload.model, "unknown model requested");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": format!("model not installed: {}", payload.model) })),
        );
    }
    MODEL_SWITCHES.inc();
    tracing::info!(model = %payload.model, "model selected");
    (StatusCode::OK, Json(json!({ "ok": true, "model": payload.model })))
}
