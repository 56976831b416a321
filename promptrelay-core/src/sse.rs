//! Server-Sent Events framing.
//!
//! The relay writes exactly one `data: <json>` line per frame and terminates
//! every frame with a blank line. The decoder is more lenient so it can also
//! read upstream OpenAI-style streams: it skips comment lines (`: keep-alive`),
//! ignores `event:`/`id:`/`retry:` fields, joins multiple `data:` lines with
//! `\n` and accepts CRLF line endings.

use bytes::Bytes;

use crate::error::{CoreResult, RelayError};
use crate::stream::StreamChunk;

/// Encode one chunk as a complete SSE frame.
pub fn encode_frame(chunk: &StreamChunk) -> CoreResult<Bytes> {
    let json = serde_json::to_string(chunk).map_err(|e| RelayError::Other(e.into()))?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// The `data` payload of one complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    pub fn parse_chunk(&self) -> CoreResult<StreamChunk> {
        serde_json::from_str(&self.data)
            .map_err(|e| RelayError::Decode(format!("{e}: {}", self.data)))
    }
}

/// Incremental frame decoder. Bytes are consumed one line at a time and
/// every byte is examined once, so a read boundary may fall anywhere,
/// including inside a UTF-8 sequence or between the `\r` and `\n` of a
/// CRLF. Lines may end in `\r\n`, `\n` or `\r`; an empty line closes the
/// frame.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
    after_cr: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame they complete, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &b in bytes {
            if std::mem::take(&mut self.after_cr) && b == b'\n' {
                // second half of a CRLF
                continue;
            }
            match b {
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut frames);
                }
                b'\n' => self.end_line(&mut frames),
                _ => self.line.push(b),
            }
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.after_cr = false;
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.field(&line);
        }
        self.dispatch()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.line.len() + self.data.iter().map(String::len).sum::<usize>()
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        if self.line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }
        let line = std::mem::take(&mut self.line);
        self.field(&line);
    }

    fn field(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line.as_ref(), ""),
        };
        if name == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { data })
    }
}
