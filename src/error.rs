use std::path::PathBuf;

/// Failures while preparing or running the embedded backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to spawn backend thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend app construction failed: {0}")]
    App(String),

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

impl BackendError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures inside the streaming client. These never reach callers directly;
/// they are folded into error payloads and error stream events.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("stream closed before a terminal event")]
    Truncated,

    #[error("failed to build client runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;
