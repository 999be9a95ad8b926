use futures_util::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::{EventDecoder, StreamEvent};
use super::{EventCallback, ProbeCallback, ResultCallback};
use crate::error::ClientError;
use crate::models::{ChatRequest, SetModelRequest};

const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

// Work scheduled onto the client's background loop
pub(crate) enum Job {
    ChatStream {
        request: ChatRequest,
        on_event: EventCallback,
    },
    Models {
        on_result: ResultCallback,
    },
    SetModel {
        tag: String,
        on_result: ResultCallback,
    },
    Health {
        timeout: Duration,
        on_result: ResultCallback,
    },
    // answered with whether /api/health returned a 2xx; the body is ignored
    Probe {
        timeout: Duration,
        on_result: ProbeCallback,
    },
}

impl Job {
    // Report a job that never reached the loop
    pub(crate) fn abandon(self, reason: &str) {
        match self {
            Job::ChatStream { mut on_event, .. } => on_event(StreamEvent::error(reason)),
            Job::Models { on_result } | Job::SetModel { on_result, .. } => {
                on_result(json!({ "error": reason }))
            }
            Job::Health { on_result, .. } => on_result(json!({ "ok": false, "error": reason })),
            Job::Probe { on_result, .. } => on_result(false),
        }
    }
}

// Runs for the lifetime of the client. Each job gets its own task so a long
// chat stream never holds up a health check; the loop ends when the client
// drops its sender.
pub(crate) async fn client_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    http: reqwest::Client,
    base: String,
) {
    tracing::debug!(%base, "chat client loop started");

    while let Some(job) = rx.recv().await {
        let http = http.clone();
        let base = base.clone();
        tokio::spawn(async move { run_job(job, &http, &base).await });
    }

    tracing::debug!(%base, "chat client loop stopped");
}

async fn run_job(job: Job, http: &reqwest::Client, base: &str) {
    match job {
        Job::ChatStream {
            request,
            mut on_event,
        } => {
            let url = format!("{base}/api/chat/stream");
            if let Err(e) = stream_chat(http, &url, &request, &mut on_event).await {
                let message = describe(&e);
                tracing::warn!(%url, error = %message, "chat stream failed");
                on_event(StreamEvent::error(message));
            }
        }
        Job::Models { on_result } => {
            let req = http
                .get(format!("{base}/api/models"))
                .timeout(MODELS_TIMEOUT);
            on_result(fetch_json(req).await.unwrap_or_else(|e| json!({ "error": describe(&e) })));
        }
        Job::SetModel { tag, on_result } => {
            let req = http
                .post(format!("{base}/api/models/set"))
                .json(&SetModelRequest { model: tag });
            on_result(fetch_json(req).await.unwrap_or_else(|e| json!({ "error": describe(&e) })));
        }
        Job::Health { timeout, on_result } => {
            let req = http.get(format!("{base}/api/health")).timeout(timeout);
            on_result(
                fetch_json(req)
                    .await
                    .unwrap_or_else(|e| json!({ "ok": false, "error": describe(&e) })),
            );
        }
        Job::Probe { timeout, on_result } => {
            let url = format!("{base}/api/health");
            let up = match http.get(&url).timeout(timeout).send().await {
                Ok(res) => res.status().is_success(),
                Err(e) => {
                    tracing::trace!(%url, error = %e, "health probe failed");
                    false
                }
            };
            on_result(up);
        }
    }
}

// Deliver events in arrival order until a terminal one. Anything that keeps
// the stream from reaching done/error is an Err for the caller to report.
async fn stream_chat(
    http: &reqwest::Client,
    url: &str,
    request: &ChatRequest,
    on_event: &mut EventCallback,
) -> Result<(), ClientError> {
    let res = http.post(url).json(request).send().await?;

    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }

    let mut decoder = EventDecoder::new();
    let mut body = res.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for event in decoder.push(&chunk) {
            let terminal = event.is_terminal();
            on_event(event);
            if terminal {
                return Ok(());
            }
        }
    }

    if let Some(event) = decoder.finish() {
        let terminal = event.is_terminal();
        on_event(event);
        if terminal {
            return Ok(());
        }
    }

    Err(ClientError::Truncated)
}

async fn fetch_json(req: reqwest::RequestBuilder) -> Result<Value, ClientError> {
    let res = req.send().await?;
    Ok(res.json::<Value>().await?)
}

// reqwest keeps the interesting part (connection refused, timed out) in the
// source chain
fn describe(err: &ClientError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = std::error::Error::source(cause);
    }
    message
}
