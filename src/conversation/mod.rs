//! Conversation controller: transcript, single-in-flight streaming state
//! and telemetry, independent of how the UI shell draws any of it.
//!
//! Events arrive on the transport's thread. State changes happen under the
//! controller's lock; render instructions are handed to the [`ChatView`]
//! after the lock is released.

mod attachment;
mod telemetry;

pub use attachment::{Attachment, build_user_content};
pub use telemetry::{Telemetry, estimate_tokens};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::client::{ChatTransport, StreamEvent};
use crate::models::{ChatRequest, ConversationTurn, Role, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    Streaming,
}

/// What the UI shell should draw next.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOp {
    UserTurn(String),
    AssistantDelta(String),
    AssistantDone,
    /// Inline system notice (tool activity, errors).
    Notice(String),
    Telemetry(Telemetry),
    /// Streaming started (`true`) or finished (`false`).
    Busy(bool),
}

/// Receives render instructions. Called from whichever thread produced them.
pub trait ChatView: Send + Sync {
    fn render(&self, op: RenderOp);
}

impl<F> ChatView for F
where
    F: Fn(RenderOp) + Send + Sync,
{
    fn render(&self, op: RenderOp) {
        self(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    /// An exchange is already in flight; nothing happened.
    Busy,
    /// No prompt text and no attachments; nothing happened.
    Empty,
}

struct Inner {
    state: ChatState,
    history: Vec<ConversationTurn>,
    settings: Settings,
    system: String,
    attachments: Vec<Attachment>,
    assistant_buf: String,
    started_at: Option<Instant>,
    first_byte: Option<Instant>,
    output_tokens: usize,
    input_tokens: Option<usize>,
}

impl Inner {
    fn telemetry(&self) -> Telemetry {
        let input_tokens = self.input_tokens.unwrap_or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|turn| turn.role == Role::User)
                .map_or(0, |turn| estimate_tokens(&turn.content))
        });
        let first_byte_latency = match (self.started_at, self.first_byte) {
            (Some(start), Some(first)) => Some(first.saturating_duration_since(start)),
            _ => None,
        };
        Telemetry {
            input_tokens,
            output_tokens: self.output_tokens,
            first_byte_latency,
        }
    }

    fn finish(&mut self, ops: &mut Vec<RenderOp>) {
        self.state = ChatState::Idle;
        ops.push(RenderOp::Busy(false));
    }

    fn apply(&mut self, event: StreamEvent) -> Vec<RenderOp> {
        if self.state != ChatState::Streaming {
            tracing::debug!(?event, "dropping stream event while idle");
            return Vec::new();
        }

        let mut ops = Vec::new();
        match event {
            StreamEvent::Delta { delta } => {
                if self.first_byte.is_none() {
                    self.first_byte = Some(Instant::now());
                }
                if !delta.is_empty() {
                    self.output_tokens = self.output_tokens.max(estimate_tokens(&delta));
                    self.assistant_buf.push_str(&delta);
                    ops.push(RenderOp::AssistantDelta(delta));
                }
                ops.push(RenderOp::Telemetry(self.telemetry()));
            }
            StreamEvent::ToolCalls => ops.push(RenderOp::Notice("[tools] running…".into())),
            StreamEvent::ToolResult { name } => ops.push(RenderOp::Notice(format!(
                "[tool:{}] done",
                name.as_deref().unwrap_or("unknown")
            ))),
            StreamEvent::Done => {
                ops.push(RenderOp::AssistantDone);
                let reply = std::mem::take(&mut self.assistant_buf);
                if !reply.is_empty() {
                    self.history.push(ConversationTurn::assistant(reply));
                }
                self.finish(&mut ops);
            }
            StreamEvent::Error { message } => {
                ops.push(RenderOp::Notice(format!("Error: {message}")));
                self.assistant_buf.clear();
                self.finish(&mut ops);
            }
        }
        ops
    }
}

pub struct Conversation {
    inner: Arc<Mutex<Inner>>,
    transport: Arc<dyn ChatTransport>,
    view: Arc<dyn ChatView>,
}

impl Conversation {
    pub fn new(transport: Arc<dyn ChatTransport>, view: Arc<dyn ChatView>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ChatState::Idle,
                history: Vec::new(),
                settings: Settings::default(),
                system: String::new(),
                attachments: Vec::new(),
                assistant_buf: String::new(),
                started_at: None,
                first_byte: None,
                output_tokens: 0,
                input_tokens: None,
            })),
            transport,
            view,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, prompt: &str) -> SubmitOutcome {
        self.submit_with_estimate(prompt, None)
    }

    /// Submit a prompt, optionally overriding the input-token estimate shown
    /// in telemetry for this exchange.
    pub fn submit_with_estimate(&self, prompt: &str, input_tokens: Option<usize>) -> SubmitOutcome {
        let (request, ops) = {
            let mut inner = self.lock();
            if inner.state == ChatState::Streaming {
                tracing::debug!("submit rejected: exchange in flight");
                return SubmitOutcome::Busy;
            }
            let prompt = prompt.trim();
            if prompt.is_empty() && inner.attachments.is_empty() {
                return SubmitOutcome::Empty;
            }

            let attachments = std::mem::take(&mut inner.attachments);
            let content = build_user_content(prompt, &attachments);
            inner.history.push(ConversationTurn::user(content.clone()));

            inner.state = ChatState::Streaming;
            inner.started_at = Some(Instant::now());
            inner.first_byte = None;
            inner.output_tokens = 0;
            inner.input_tokens = input_tokens;
            inner.assistant_buf.clear();

            // snapshot: later edits must not reach this request
            let request = ChatRequest {
                messages: inner.history.clone(),
                settings: inner.settings.clone(),
                system: inner.system.clone(),
            };
            let ops = vec![
                RenderOp::UserTurn(content),
                RenderOp::Busy(true),
                RenderOp::Telemetry(inner.telemetry()),
            ];
            (request, ops)
        };

        self.render_all(ops);

        let inner = Arc::clone(&self.inner);
        let view = Arc::clone(&self.view);
        self.transport.chat_stream(
            request,
            Box::new(move |event: StreamEvent| {
                let ops = inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply(event);
                for op in ops {
                    view.render(op);
                }
            }),
        );
        SubmitOutcome::Started
    }

    pub fn attach(&self, attachment: Attachment) {
        self.lock().attachments.push(attachment);
    }

    /// Attach a file from disk; a failure shows up as a notice.
    pub fn attach_path(&self, path: &Path) -> bool {
        match Attachment::from_path(path) {
            Ok(attachment) => {
                self.attach(attachment);
                true
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "attachment failed");
                self.view.render(RenderOp::Notice(format!("Failed to attach: {e}")));
                false
            }
        }
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.lock().attachments.clone()
    }

    pub fn state(&self) -> ChatState {
        self.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == ChatState::Streaming
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.lock().history.clone()
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        self.lock().settings = settings;
    }

    pub fn system(&self) -> String {
        self.lock().system.clone()
    }

    pub fn set_system(&self, system: impl Into<String>) {
        self.lock().system = system.into();
    }

    pub fn telemetry(&self) -> Telemetry {
        self.lock().telemetry()
    }

    fn render_all(&self, ops: Vec<RenderOp>) {
        for op in ops {
            self.view.render(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventCallback;
    use crate::client::protocol::EventDecoder;

    #[derive(Default)]
    struct FakeTransport {
        requests: Mutex<Vec<ChatRequest>>,
        callbacks: Mutex<Vec<EventCallback>>,
    }

    impl FakeTransport {
        fn fire(&self, call: usize, event: StreamEvent) {
            let mut callbacks = self.callbacks.lock().unwrap();
            let callback = &mut callbacks[call];
            callback(event);
        }

        // feed a raw body through the real line decoder
        fn replay(&self, call: usize, body: &str) {
            for event in EventDecoder::new().push(body.as_bytes()) {
                self.fire(call, event);
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ChatTransport for FakeTransport {
        fn chat_stream(&self, request: ChatRequest, on_event: EventCallback) {
            self.requests.lock().unwrap().push(request);
            self.callbacks.lock().unwrap().push(on_event);
        }
    }

    #[derive(Default)]
    struct RecordingView(Mutex<Vec<RenderOp>>);

    impl ChatView for RecordingView {
        fn render(&self, op: RenderOp) {
            self.0.lock().unwrap().push(op);
        }
    }

    impl RecordingView {
        fn notices(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|op| match op {
                    RenderOp::Notice(text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn setup() -> (Conversation, Arc<FakeTransport>, Arc<RecordingView>) {
        let transport = Arc::new(FakeTransport::default());
        let view = Arc::new(RecordingView::default());
        let conversation = Conversation::new(transport.clone(), view.clone());
        (conversation, transport, view)
    }

    #[test]
    fn submit_while_streaming_is_a_no_op() {
        let (chat, transport, _) = setup();
        assert_eq!(chat.submit("hello"), SubmitOutcome::Started);
        assert_eq!(chat.submit("world"), SubmitOutcome::Busy);

        assert_eq!(chat.history(), vec![ConversationTurn::user("hello")]);
        assert_eq!(transport.requests().len(), 1);
        assert!(chat.is_streaming());
    }

    #[test]
    fn empty_submission_is_ignored() {
        let (chat, transport, view) = setup();
        assert_eq!(chat.submit("   \n"), SubmitOutcome::Empty);
        assert_eq!(chat.state(), ChatState::Idle);
        assert!(chat.history().is_empty());
        assert!(transport.requests().is_empty());
        assert!(view.0.lock().unwrap().is_empty());
    }

    #[test]
    fn scripted_stream_appends_one_assistant_turn() {
        let (chat, transport, view) = setup();
        chat.submit("hello");
        transport.replay(
            0,
            "data: {\"type\":\"delta\",\"delta\":\"Hi\"}\n\n\
             data: {\"type\":\"delta\",\"delta\":\" there\"}\n\n\
             data: {\"type\":\"done\"}\n\n",
        );

        assert_eq!(chat.state(), ChatState::Idle);
        assert_eq!(
            chat.history(),
            vec![
                ConversationTurn::user("hello"),
                ConversationTurn::assistant("Hi there"),
            ]
        );
        let ops = view.0.lock().unwrap().clone();
        assert!(ops.contains(&RenderOp::AssistantDelta("Hi".into())));
        assert!(ops.contains(&RenderOp::AssistantDelta(" there".into())));
        assert_eq!(ops.last(), Some(&RenderOp::Busy(false)));
    }

    #[test]
    fn error_mid_stream_returns_to_idle_without_assistant_turn() {
        let (chat, transport, view) = setup();
        chat.submit("hello");
        transport.replay(
            0,
            "data: {\"type\":\"delta\",\"delta\":\"partial\"}\n\
             data: {\"type\":\"error\",\"message\":\"boom\"}\n",
        );

        assert_eq!(chat.state(), ChatState::Idle);
        assert_eq!(chat.history(), vec![ConversationTurn::user("hello")]);
        let notices = view.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("boom"));

        // retry is possible right away, and the partial reply is gone
        assert_eq!(chat.submit("again"), SubmitOutcome::Started);
        transport.fire(1, StreamEvent::Done);
        assert_eq!(chat.history().len(), 2);
    }

    #[test]
    fn done_without_text_adds_no_assistant_turn() {
        let (chat, transport, _) = setup();
        chat.submit("hello");
        transport.fire(0, StreamEvent::Delta { delta: String::new() });
        transport.fire(0, StreamEvent::Done);
        assert_eq!(chat.history().len(), 1);
        assert_eq!(chat.state(), ChatState::Idle);
    }

    #[test]
    fn settings_are_snapshotted_at_submit() {
        let (chat, transport, _) = setup();
        let before = chat.settings();
        chat.set_system("terse");
        chat.submit("hello");

        let mut changed = before.clone();
        changed.temperature = 0.1;
        changed.seed = Some(42);
        chat.set_settings(changed.clone());
        chat.set_system("verbose");

        let requests = transport.requests();
        let sent = &requests[0];
        assert_eq!(sent.settings, before);
        assert_eq!(sent.system, "terse");
        assert_eq!(
            serde_json::to_value(&sent.settings).unwrap(),
            serde_json::to_value(&before).unwrap()
        );

        // the next exchange picks up the edit and carries the full transcript
        transport.fire(0, StreamEvent::Delta { delta: "ok".into() });
        transport.fire(0, StreamEvent::Done);
        chat.submit("next");
        let requests = transport.requests();
        let second = &requests[1];
        assert_eq!(second.settings, changed);
        assert_eq!(second.system, "verbose");
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[1], ConversationTurn::assistant("ok"));
    }

    #[test]
    fn tool_events_are_notices_only() {
        let (chat, transport, view) = setup();
        chat.submit("search please");
        transport.fire(0, StreamEvent::ToolCalls);
        transport.fire(0, StreamEvent::ToolResult {
            name: Some("web".into()),
        });
        assert!(chat.is_streaming());
        assert_eq!(view.notices(), vec!["[tools] running…", "[tool:web] done"]);
        assert_eq!(chat.history().len(), 1);
    }

    #[test]
    fn attachments_fold_into_one_turn_and_are_then_cleared() {
        let (chat, transport, _) = setup();
        chat.attach(Attachment::Binary {
            name: "blob.bin".into(),
        });
        assert_eq!(chat.submit(""), SubmitOutcome::Started);

        assert_eq!(
            transport.requests()[0].messages[0].content,
            "\n\n(Attached file: blob.bin)\n"
        );
        assert!(chat.attachments().is_empty());
    }

    #[test]
    fn failed_attachment_renders_notice() {
        let (chat, _, view) = setup();
        assert!(!chat.attach_path(Path::new("/definitely/not/here.txt")));
        assert!(chat.attachments().is_empty());
        assert!(view.notices()[0].starts_with("Failed to attach:"));
    }

    #[test]
    fn telemetry_tracks_estimates_and_first_byte() {
        let (chat, transport, _) = setup();
        chat.submit("twelve chars");
        let t = chat.telemetry();
        assert_eq!(t.input_tokens, 3);
        assert_eq!(t.output_tokens, 0);
        assert_eq!(t.first_byte_latency, None);
        assert!(t.to_string().ends_with("—"));

        transport.fire(0, StreamEvent::Delta { delta: "abcdefgh".into() });
        transport.fire(0, StreamEvent::Delta { delta: "abcd".into() });
        let t = chat.telemetry();
        // max, not sum
        assert_eq!(t.output_tokens, 2);
        assert!(t.first_byte_latency.is_some());
        assert!(t.to_string().ends_with(" ms"));
    }

    #[test]
    fn explicit_input_estimate_overrides_turn_length() {
        let (chat, _, _) = setup();
        chat.submit_with_estimate("hi", Some(99));
        assert_eq!(chat.telemetry().input_tokens, 99);
    }

    #[test]
    fn events_after_completion_are_ignored() {
        let (chat, transport, view) = setup();
        chat.submit("hello");
        transport.fire(0, StreamEvent::Done);
        let rendered = view.0.lock().unwrap().len();

        transport.fire(0, StreamEvent::Delta { delta: "late".into() });
        transport.fire(0, StreamEvent::error("late"));
        assert_eq!(view.0.lock().unwrap().len(), rendered);
        assert_eq!(chat.history().len(), 1);
    }
}
