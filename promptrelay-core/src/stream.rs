//! Streaming primitives shared by the relay server and the stream consumer.
//!
//! Contract:
//! - A relay session emits 0..n non-terminal chunks (`complete == false`).
//! - It **must** end with exactly one terminal chunk: completed (carrying
//!   `fullResponse`) or failed (carrying `error`, also `complete == true`).
//! - After a terminal chunk, no further chunks are emitted.
//! - A session aborted by a client disconnect emits no terminal chunk at all.

use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};

/// One SSE payload on the relay wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    #[serde(default)]
    pub chunk: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl StreamChunk {
    /// Non-terminal increment.
    pub fn delta(text: impl Into<String>) -> Self {
        Self { chunk: text.into(), ..Default::default() }
    }

    /// Terminal success chunk.
    pub fn completed(full_response: impl Into<String>) -> Self {
        Self {
            complete: true,
            full_response: Some(full_response.into()),
            ..Default::default()
        }
    }

    /// Terminal failure chunk.
    pub fn failed(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            complete: true,
            error: Some(message.into()),
            status_code,
            ..Default::default()
        }
    }

    pub fn from_error(err: &RelayError) -> Self {
        Self::failed(err.to_string(), Some(err.status_code()))
    }

    /// True for both completed and failed chunks.
    pub fn is_terminal(&self) -> bool {
        self.complete || self.error.is_some()
    }
}

/// Lazy, finite, non-restartable sequence of upstream text increments.
pub type IncrementStream = futures::stream::BoxStream<'static, CoreResult<String>>;
