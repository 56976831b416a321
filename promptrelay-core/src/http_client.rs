use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::stream::Stream;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};
use crate::sse::{SseDecoder, SseFrame};

/// A boxed stream of decoded SSE frames.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseFrame>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
///
/// There is no client-wide total timeout: a streaming body may legitimately
/// stay open longer than any single call. `request_timeout` bounds a JSON
/// round trip, or the open (send + response headers) of an SSE call.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    label: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "prompt-relay/0.1".to_string(),
            label: "http".to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    /// Name used as `provider` in the errors this client produces.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn timeout_ms(&self) -> u64 {
        self.request_timeout.as_millis() as u64
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> RequestBuilder {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        req
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let resp = self
            .request(url, body, headers)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let provider_request_id = extract_request_id(&headers);

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let ra = parse_retry_after(&headers);
            return Err(map_http_error(&self.label, status, ra, &text));
        }

        let bytes = resp.bytes().await.map_err(|e| self.map_send_error(e))?;
        let latency = start.elapsed().as_millis() as u32;
        let parsed = serde_json::from_slice::<R>(&bytes).map_err(|e| RelayError::ProviderError {
            provider: self.label.clone(),
            status: status.as_u16(),
            message: format!("json decode error: {e}"),
        })?;
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON and return a stream of decoded SSE frames.
    pub async fn post_sse<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<SseStream> {
        let send = self
            .request(url, body, headers)
            .header("Accept", "text/event-stream")
            .send();
        let resp = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| RelayError::Timeout {
                provider: self.label.clone(),
                after_ms: self.timeout_ms(),
            })?
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(&self.label, status, ra, &body));
        }

        let frames = FrameStream::new(Box::pin(resp.bytes_stream()), self.label.clone());
        Ok(Box::pin(frames))
    }

    fn map_send_error(&self, e: reqwest::Error) -> RelayError {
        map_transport_error(&self.label, self.timeout_ms(), &e)
    }
}

fn map_transport_error(label: &str, timeout_ms: u64, e: &reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout {
            provider: label.to_string(),
            after_ms: timeout_ms,
        }
    } else {
        RelayError::Transport {
            provider: label.to_string(),
            message: e.to_string(),
        }
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-ds-trace-id"];
    CANDIDATES
        .iter()
        .filter_map(|k| headers.get(*k))
        .find_map(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    // Only the delta-seconds form; HTTP-date values are ignored.
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

pub(crate) fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s => RelayError::ProviderError {
            provider: provider.to_string(),
            status: s.as_u16(),
            message: extract_error_message(body),
        },
    }
}

/// Pull a human-readable message out of `{"error": {"message": ..}}` or
/// `{"error": ".."}` bodies; otherwise fall back to the raw body.
pub(crate) fn extract_error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| match v.get("error") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(obj) => obj.get("message").and_then(|m| m.as_str()).map(str::to_string),
            None => v.get("message").and_then(|m| m.as_str()).map(str::to_string),
        });
    truncate(from_json.as_deref().unwrap_or(body).trim(), 300)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Frame splitter over a bytes stream; yields complete SSE frames. A body
/// error is yielded once and ends the stream.
struct FrameStream {
    inner: ByteStream,
    decoder: SseDecoder,
    ready: VecDeque<SseFrame>,
    label: String,
    done: bool,
}

impl FrameStream {
    fn new(inner: ByteStream, label: String) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            label,
            done: false,
        }
    }
}

impl Stream for FrameStream {
    type Item = CoreResult<SseFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let frames = self.decoder.push(&chunk);
                    self.ready.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(map_transport_error(&self.label, 0, &e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if let Some(tail) = self.decoder.finish() {
                        self.ready.push_back(tail);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
