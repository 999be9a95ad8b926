use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::backend::metrics::HEALTH_CHECKS;
use crate::backend::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    HEALTH_CHECKS.inc();
    Json(json!({
        "ok": true,
        "model": state.current_model(),
        "app_dir": state.paths.app_dir.display().to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
