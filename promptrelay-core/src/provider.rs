use async_trait::async_trait;
use futures::StreamExt;

use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse};
use crate::stream::IncrementStream;

/// Upstream chat-completion collaborator.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Single-shot call returning the completed message.
    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse>;

    /// Incremental variant. Errors returned here happen while opening the
    /// stream; errors inside the stream happen while consuming it.
    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<IncrementStream> {
        // default: call chat once and yield its text as a single increment
        let single = self.chat(req).await?;
        Ok(futures::stream::once(async move { Ok(single.text) }).boxed())
    }
}
