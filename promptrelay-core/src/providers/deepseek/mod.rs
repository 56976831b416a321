//! DeepSeek adapter. DeepSeek speaks the OpenAI chat-completions dialect, so
//! this also works against any OpenAI-compatible base URL.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, SseStream};
use crate::model::{ChatMessage, ChatRequest, ChatResponse, StopReason};
use crate::provider::ChatProvider;
use crate::stream::IncrementStream;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct DeepSeek {
    http: HttpClient,
    base: String,
    api_key: SecretString,
}

impl DeepSeek {
    pub const NAME: &'static str = "deepseek";

    pub fn new(http: HttpClient, api_key: SecretString, base: String) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        DeepSeek::new(
            HttpClient::new_default().unwrap().labeled(Self::NAME),
            SecretString::from("test-key"),
            server_base.to_string(),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base)
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct DSChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

impl<'a> DSChatReq<'a> {
    fn from_request(req: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct DSChatResp {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<DSChoice>,
    usage: Option<DSUsage>,
}

#[derive(Deserialize)]
struct DSChoice {
    message: DSMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DSMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct DSUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct DSStreamFrame {
    #[serde(default)]
    choices: Vec<DSStreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DSStreamChoice {
    #[serde(default)]
    delta: DSDelta,
}

#[derive(Deserialize, Default)]
struct DSDelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_finish(s: Option<&str>) -> Option<StopReason> {
    match s {
        Some("stop") => Some(StopReason::Stop),
        Some("length") => Some(StopReason::Length),
        Some("content_filter") => Some(StopReason::ContentFilter),
        Some(_) => Some(StopReason::Other),
        None => None,
    }
}

/// Text of one stream frame, `None` for frames without content (role
/// announcement, finish marker, usage).
fn parse_delta(data: &str) -> CoreResult<Option<String>> {
    let frame: DSStreamFrame = serde_json::from_str(data)
        .map_err(|e| RelayError::Decode(format!("upstream stream frame: {e}")))?;
    if let Some(err) = frame.error {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(RelayError::ProviderError {
            provider: DeepSeek::NAME.to_string(),
            status: 502,
            message,
        });
    }
    Ok(frame
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content))
}

/// Turn upstream SSE frames into text increments. Ends at `[DONE]`, at end
/// of body, or right after the first error.
fn increments(frames: SseStream) -> IncrementStream {
    futures::stream::unfold(Some(frames), |state| async move {
        let mut frames = state?;
        loop {
            match frames.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), None)),
                Some(Ok(frame)) => {
                    if frame.data.trim() == DONE_SENTINEL {
                        return None;
                    }
                    match parse_delta(&frame.data) {
                        Ok(Some(text)) => return Some((Ok(text), Some(frames))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), None)),
                    }
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ChatProvider for DeepSeek {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let payload = DSChatReq::from_request(&req, false);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (resp, provider_id, latency_ms) = self
            .http
            .post_json::<_, DSChatResp>(&self.url(), &payload, &hdrs)
            .await?;

        let first = resp.choices.into_iter().next();
        let stop_reason = first
            .as_ref()
            .and_then(|c| map_finish(c.finish_reason.as_deref()));
        let text = first
            .and_then(|c| c.message.content)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RelayError::EmptyResponse {
                provider: Self::NAME.to_string(),
            })?;
        let (usage_p, usage_c) = resp
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            model: req.model,
            text,
            usage_prompt: usage_p,
            usage_completion: usage_c,
            provider: Self::NAME.to_string(),
            stop_reason,
            provider_request_id: provider_id.or(resp.id),
            latency_ms,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<IncrementStream> {
        let payload = DSChatReq::from_request(&req, true);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let frames = self.http.post_sse(&self.url(), &payload, &hdrs).await?;
        Ok(increments(frames))
    }
}
