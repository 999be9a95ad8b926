use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

// One entry of the transcript sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters forwarded verbatim to the backend.
///
/// Options the backend understands but this struct does not name are kept in
/// `extra` and flattened back into the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub dynamic_ctx: bool,
    pub max_ctx: u32,
    pub num_ctx: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dynamic_ctx: true,
            max_ctx: 40000,
            num_ctx: 8192,
            temperature: 0.9,
            top_p: 0.9,
            top_k: 100,
            num_predict: None,
            seed: None,
            extra: Map::new(),
        }
    }
}

// Body of POST /api/chat/stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ConversationTurn>,
    pub settings: Settings,
    pub system: String,
}

// Body of POST /api/models/set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetModelRequest {
    pub model: String,
}

/// Interpretation of a `/api/health` payload (or the client's failure payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    Up { model: Option<String> },
    Down { error: String },
}

impl HealthReport {
    pub fn from_value(value: &Value) -> Self {
        if value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let model = value
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Self::Up { model };
        }
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        Self::Down { error }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up { .. })
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Up { model } => format!(
                "Backend OK • model: {}",
                model.as_deref().unwrap_or("none")
            ),
            Self::Down { error } => format!("Backend DOWN: {error}"),
        }
    }
}
