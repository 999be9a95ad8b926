use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, TextEncoder, register_counter};

lazy_static! {
    pub static ref CHAT_STREAMS: Counter =
        register_counter!("steelchat_chat_streams_total", "Total chat streams served")
            .expect("chat stream counter registers once");
    pub static ref HEALTH_CHECKS: Counter =
        register_counter!("steelchat_health_checks_total", "Total health checks served")
            .expect("health check counter registers once");
    pub static ref MODEL_SWITCHES: Counter =
        register_counter!("steelchat_model_switches_total", "Total successful model switches")
            .expect("model switch counter registers once");
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
