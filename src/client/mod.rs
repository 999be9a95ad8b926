//! Streaming chat client for the embedded backend.
//!
//! A [`ChatClient`] owns one background thread running a single-threaded
//! tokio runtime. Public methods only enqueue work and return immediately;
//! results arrive later through callbacks invoked on that background thread.
//! Hopping back to a UI thread is the caller's business.

pub mod protocol;
mod worker;

use serde_json::Value;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::models::{ChatRequest, ConversationTurn, Settings};
pub use protocol::StreamEvent;
use worker::{Job, client_worker};

pub type EventCallback = Box<dyn FnMut(StreamEvent) + Send + 'static>;
pub type ResultCallback = Box<dyn FnOnce(Value) + Send + 'static>;
pub type ProbeCallback = Box<dyn FnOnce(bool) + Send + 'static>;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Anything that can carry a chat exchange to a backend.
pub trait ChatTransport: Send + Sync {
    fn chat_stream(&self, request: ChatRequest, on_event: EventCallback);
}

pub struct ChatClient {
    base: String,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Start the client's background loop against `base`
    /// (e.g. `http://127.0.0.1:8765`).
    pub fn new(base: impl Into<String>) -> Result<Self, ClientError> {
        let base = base.into().trim_end_matches('/').to_string();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;
        let http = reqwest::Client::builder().build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let loop_base = base.clone();
        let thread = std::thread::Builder::new()
            .name("chat-client".into())
            .spawn(move || runtime.block_on(client_worker(rx, http, loop_base)))
            .map_err(ClientError::Runtime)?;

        Ok(Self {
            base,
            jobs: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn for_port(port: u16) -> Result<Self, ClientError> {
        Self::new(format!("http://127.0.0.1:{port}"))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Stream a chat completion. `history`, `settings` and `system` are
    /// copied now, so later edits by the caller never reach this request.
    pub fn chat_stream<F>(
        &self,
        history: &[ConversationTurn],
        settings: &Settings,
        system: &str,
        on_event: F,
    ) where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        let request = ChatRequest {
            messages: history.to_vec(),
            settings: settings.clone(),
            system: system.to_string(),
        };
        self.send_chat(request, Box::new(on_event));
    }

    pub fn send_chat(&self, request: ChatRequest, on_event: EventCallback) {
        self.schedule(Job::ChatStream { request, on_event });
    }

    /// GET /api/models; `{error}` on failure.
    pub fn models<F>(&self, on_result: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.schedule(Job::Models {
            on_result: Box::new(on_result),
        });
    }

    /// POST /api/models/set; `{error}` on failure.
    pub fn set_model<F>(&self, tag: impl Into<String>, on_result: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.schedule(Job::SetModel {
            tag: tag.into(),
            on_result: Box::new(on_result),
        });
    }

    /// GET /api/health; `{ok: false, error}` on failure, never an error.
    pub fn health<F>(&self, on_result: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.schedule(Job::Health {
            timeout: HEALTH_TIMEOUT,
            on_result: Box::new(on_result),
        });
    }

    /// Block the calling thread until `/api/health` answers with a 2xx status
    /// or `timeout` runs out. The body is not inspected: a backend that is up
    /// but reports `ok: false` still counts. Must not be called from inside a
    /// client callback.
    pub fn wait_healthy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let (tx, rx) = std_mpsc::channel();
            self.schedule(Job::Probe {
                timeout: HEALTH_POLL_TIMEOUT,
                on_result: Box::new(move |up: bool| {
                    let _ = tx.send(up);
                }),
            });

            // the probe itself is bounded by HEALTH_POLL_TIMEOUT
            if rx.recv_timeout(HEALTH_POLL_TIMEOUT * 2) == Ok(true) {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(base = %self.base, ?timeout, "backend never reported healthy");
                return false;
            }
            std::thread::sleep(HEALTH_POLL_INTERVAL.min(remaining));
        }
    }

    fn schedule(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            job.abandon("chat client is shut down");
            return;
        };
        if let Err(mpsc::error::SendError(job)) = jobs.send(job) {
            job.abandon("chat client loop has stopped");
        }
    }
}

impl ChatTransport for ChatClient {
    fn chat_stream(&self, request: ChatRequest, on_event: EventCallback) {
        self.send_chat(request, on_event);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        // closing the channel ends the loop; in-flight requests die with the runtime
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(base = %self.base, "chat client thread panicked");
            }
        }
    }
}
