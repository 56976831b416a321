//! In-memory collaborators shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse, StopReason};
use crate::provider::ChatProvider;
use crate::relay::{ChunkSink, Disconnected};
use crate::stream::{IncrementStream, StreamChunk};

/// Increment stream yielding `items` in order.
pub fn scripted(items: Vec<CoreResult<&'static str>>) -> IncrementStream {
    futures::stream::iter(items.into_iter().map(|r| r.map(str::to_string))).boxed()
}

type ChatScript = Box<dyn Fn() -> CoreResult<String> + Send + Sync>;
type StreamScript = Box<dyn Fn() -> CoreResult<IncrementStream> + Send + Sync>;

/// Provider answering from closures and counting calls.
pub struct ScriptedProvider {
    calls: AtomicUsize,
    last: Mutex<Option<ChatRequest>>,
    chat: ChatScript,
    stream: StreamScript,
}

impl ScriptedProvider {
    pub const PROMPT_TOKENS: u32 = 11;
    pub const COMPLETION_TOKENS: u32 = 7;

    /// Replies `"optimized"` to `chat` and streams `"Hel", "lo"`.
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
            chat: Box::new(|| Ok("optimized".to_string())),
            stream: Box::new(|| Ok(scripted(vec![Ok("Hel"), Ok("lo")]))),
        }
    }

    pub fn with_chat(mut self, f: impl Fn() -> CoreResult<String> + Send + Sync + 'static) -> Self {
        self.chat = Box::new(f);
        self
    }

    pub fn with_stream(
        mut self,
        f: impl Fn() -> CoreResult<IncrementStream> + Send + Sync + 'static,
    ) -> Self {
        self.stream = Box::new(f);
        self
    }

    /// Upstream calls made, `chat` and `chat_stream` combined.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last.lock().unwrap().clone()
    }

    fn record(&self, req: &ChatRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(req.clone());
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        self.record(&req);
        let text = (self.chat)()?;
        Ok(ChatResponse {
            model: req.model,
            text,
            usage_prompt: Self::PROMPT_TOKENS,
            usage_completion: Self::COMPLETION_TOKENS,
            provider: "scripted".into(),
            stop_reason: Some(StopReason::Stop),
            provider_request_id: None,
            latency_ms: 0,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<IncrementStream> {
        self.record(&req);
        (self.stream)()
    }
}

/// Sink keeping every chunk; optionally "disconnects" after `n` writes.
pub struct RecordingSink {
    chunks: Vec<StreamChunk>,
    close_after: Option<usize>,
    closed: CancellationToken,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self { chunks: Vec::new(), close_after: None, closed: CancellationToken::new() }
    }

    pub fn closing_after(n: usize) -> Self {
        Self { close_after: Some(n), ..Self::new() }
    }

    pub fn chunks(&self) -> Vec<StreamChunk> {
        self.chunks.clone()
    }
}

#[async_trait]
impl ChunkSink for RecordingSink {
    async fn send(&mut self, chunk: StreamChunk) -> Result<(), Disconnected> {
        if self.closed.is_cancelled() {
            return Err(Disconnected);
        }
        self.chunks.push(chunk);
        if self.close_after == Some(self.chunks.len()) {
            self.closed.cancel();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}
