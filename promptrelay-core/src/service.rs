use std::sync::Arc;
use std::time::Instant;

use crate::error::CoreResult;
use crate::model::{ChatRequest, OptimizeRequest, StopReason};
use crate::normalizer::build_chat_request;
use crate::provider::ChatProvider;
use crate::relay::{self, ChunkSink, RelayReport, RelaySession};
use crate::stream::IncrementStream;
use crate::telemetry::{self, RelayLog, RelayMode};

/// Validates optimize requests and hands them to the upstream provider.
#[derive(Clone)]
pub struct PromptService {
    provider: Arc<dyn ChatProvider>,
    model: String,
}

impl PromptService {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>) -> Self {
        Self { provider, model: model.into() }
    }

    /// Single-shot optimize. Validation failures never reach the provider.
    pub async fn optimize(&self, req: &OptimizeRequest) -> CoreResult<String> {
        let chat = build_chat_request(req, &self.model)?;
        let started = Instant::now();
        let result = self.provider.chat(chat).await;

        let mut log = RelayLog::new(RelayMode::Single)
            .model(&self.model)
            .chunks(1)
            .latency_ms(started.elapsed().as_millis() as u64);
        log = match &result {
            Ok(resp) => {
                let stop_reason = resp.stop_reason.map(StopReason::as_str);
                tracing::debug!(
                    provider = %resp.provider,
                    provider_request_id = ?resp.provider_request_id,
                    latency_ms = resp.latency_ms,
                    tokens_prompt = resp.usage_prompt,
                    tokens_completion = resp.usage_completion,
                    stop_reason = ?stop_reason,
                    "optimize completed"
                );
                log = log
                    .outcome("completed")
                    .response_len(resp.text.len())
                    .usage(resp.usage_prompt, resp.usage_completion)
                    .status_code(200);
                match stop_reason {
                    Some(reason) => log.stop_reason(reason),
                    None => log,
                }
            }
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    kind = e.kind(),
                    error = %e,
                    "optimize failed"
                );
                log.outcome("errored").error(e)
            }
        };
        telemetry::emit(log);

        result.map(|resp| resp.text)
    }

    /// Validate a streaming request without contacting upstream.
    pub fn prepare_stream(&self, req: &OptimizeRequest) -> CoreResult<PreparedStream> {
        let request = build_chat_request(req, &self.model)?;
        Ok(PreparedStream { provider: self.provider.clone(), request })
    }
}

/// A validated streaming request, not yet sent upstream.
pub struct PreparedStream {
    provider: Arc<dyn ChatProvider>,
    request: ChatRequest,
}

impl PreparedStream {
    /// Open the upstream stream.
    pub async fn open(self) -> CoreResult<IncrementStream> {
        self.provider.chat_stream(self.request).await
    }

    /// Open upstream and relay it into `sink` in a fresh session.
    pub async fn relay<S: ChunkSink + ?Sized>(self, sink: &mut S) -> RelayReport {
        let session = RelaySession::new(self.request.model.clone());
        relay::run(session, self.open(), sink).await
    }
}
