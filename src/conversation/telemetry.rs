use std::fmt;
use std::time::Duration;

// Coarse 4-characters-per-token estimate; not real tokenization.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Telemetry {
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Submit to first delta; `None` until a delta arrives.
    pub first_byte_latency: Option<Duration>,
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tkn: {}/{} • ", self.input_tokens, self.output_tokens)?;
        match self.first_byte_latency {
            Some(latency) => write!(f, "{} ms", latency.as_millis()),
            None => f.write_str("—"),
        }
    }
}
