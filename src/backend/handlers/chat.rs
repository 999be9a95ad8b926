use axum::{
    Json,
    extract::State,
    response::sse::{Event, Sse},
};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;

use crate::backend::metrics::CHAT_STREAMS;
use crate::backend::state::AppState;
use crate::client::StreamEvent;
use crate::models::{ChatRequest, Role};

// Echo the latest user turn back word by word, then done
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    CHAT_STREAMS.inc();
    tracing::debug!(
        turns = payload.messages.len(),
        temperature = payload.settings.temperature,
        "chat stream requested"
    );

    let events = match payload.messages.iter().rev().find(|t| t.role == Role::User) {
        Some(turn) => echo_events(&state.current_model(), &turn.content),
        None => vec![StreamEvent::error("no user message in request")],
    };

    let frames = events
        .into_iter()
        .filter_map(|event| serde_json::to_string(&event).ok())
        .map(|json| Ok(Event::default().data(json)));
    Sse::new(stream::iter(frames))
}

pub(crate) fn echo_events(model: &str, content: &str) -> Vec<StreamEvent> {
    let reply = format!("[{model}] {content}");
    let mut events: Vec<StreamEvent> = reply
        .split_inclusive(' ')
        .map(|word| StreamEvent::Delta {
            delta: word.to_string(),
        })
        .collect();
    events.push(StreamEvent::Done);
    events
}
