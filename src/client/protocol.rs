//! The `data: <json>` line protocol spoken by `/api/chat/stream`.
//!
//! Lines are split incrementally from raw body chunks, so a line (or a UTF-8
//! sequence) may straddle chunk boundaries. Lines that are not `data:` lines,
//! have an empty payload, or do not decode into a [`StreamEvent`] are dropped.

use serde::{Deserialize, Serialize};

/// Longest unterminated line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One event of a streamed chat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        #[serde(default)]
        delta: String,
    },
    ToolCalls,
    ToolResult {
        #[serde(default)]
        name: Option<String>,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    // done and error end a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

// Parse one complete line. None means "not an event", never an error.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::trace!(error = %e, "dropping undecodable stream line");
            None
        }
    }
}

/// Incremental splitter turning body chunks into complete lines.
///
/// A line growing past [`MAX_LINE_BYTES`] is dropped whole, up to and
/// including its eventual newline.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // earlier bytes were already scanned and hold no newline
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for pos in scan_from..self.pending.len() {
            if self.pending[pos] != b'\n' {
                continue;
            }
            if self.overflowed {
                self.overflowed = false;
            } else {
                lines.push(String::from_utf8_lossy(&self.pending[start..pos]).into_owned());
            }
            start = pos + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_LINE_BYTES {
            tracing::warn!(bytes = self.pending.len(), "dropping oversized stream line");
            self.pending.clear();
            self.overflowed = true;
        }
        lines
    }

    /// The trailing unterminated line, if any, once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.overflowed) || self.pending.is_empty() {
            self.pending.clear();
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Line buffer plus parser: chunks in, events out, in arrival order.
#[derive(Debug, Default)]
pub struct EventDecoder {
    lines: LineBuffer,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| parse_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Option<StreamEvent> {
        self.lines.finish().as_deref().and_then(parse_line)
    }
}
