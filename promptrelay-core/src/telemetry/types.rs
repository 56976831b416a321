use serde::{Deserialize, Serialize};

/// Which entry point produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    #[default]
    Single,
    Stream,
}

/// Structured log event for one finished relay call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayLog {
    pub mode: RelayMode,

    /// Relay-assigned id; streaming sessions only.
    pub session_id: Option<String>,

    pub model: Option<String>,

    /// `completed`, `errored` or `aborted`.
    pub outcome: String,

    /// Chunks written downstream, terminal chunk included.
    pub chunks: u32,

    /// Length in bytes of the text relayed (partial for aborted/errored streams).
    pub response_len: usize,

    pub latency_ms: u64,

    /// Upstream token usage; single-shot calls only.
    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub stop_reason: Option<String>,

    pub status_code: Option<u16>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl RelayLog {
    pub fn new(mode: RelayMode) -> Self { Self { mode, ..Default::default() } }
    pub fn session_id(mut self, v: &str) -> Self { self.session_id = Some(v.to_string()); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn outcome(mut self, v: &str) -> Self { self.outcome = v.to_string(); self }
    pub fn chunks(mut self, v: u32) -> Self { self.chunks = v; self }
    pub fn response_len(mut self, v: usize) -> Self { self.response_len = v; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = v; self }
    pub fn status_code(mut self, v: u16) -> Self { self.status_code = Some(v); self }
    pub fn stop_reason(mut self, v: &str) -> Self { self.stop_reason = Some(v.to_string()); self }

    pub fn usage(mut self, prompt: u32, completion: u32) -> Self {
        self.tokens_prompt = Some(prompt);
        self.tokens_completion = Some(completion);
        self
    }

    /// Copy classification fields from an error.
    pub fn error(mut self, err: &crate::error::RelayError) -> Self {
        self.status_code = Some(err.status_code());
        self.error_kind = Some(err.kind().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}
