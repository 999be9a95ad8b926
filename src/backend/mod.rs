//! Loopback stub of the chat backend's HTTP surface.
//!
//! It answers the endpoints the client consumes so the host binary and the
//! end-to-end tests have something to supervise. Replies echo the latest
//! user turn; there is no model behind it.

mod handlers;
pub mod metrics;
mod state;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

pub use state::AppState;

use crate::environment::ServicePaths;
use crate::error::Result;
use handlers::{chat_stream_handler, health_handler, models_handler, set_model_handler};

pub fn router(paths: &ServicePaths, installed: Vec<String>) -> Router {
    let state = Arc::new(AppState::new(paths.clone(), installed));

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/models", get(models_handler))
        .route("/api/models/set", post(set_model_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state)
}

/// Factory for [`crate::supervisor::EmbeddedBackend::new`].
pub fn app_factory(installed: Vec<String>) -> impl Fn(&ServicePaths) -> Result<Router> + Send + Sync + 'static {
    move |paths: &ServicePaths| Ok(router(paths, installed.clone()))
}
