//! Consumer side of the relay: single-shot and streaming calls against a
//! running relay server.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, SseStream};
use crate::model::{OptimizeRequest, OptimizeResponse};
use crate::stream::StreamChunk;

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: HttpClient,
    base_url: String,
}

impl RelayClient {
    pub const LABEL: &'static str = "relay";

    /// `base_url` is the relay root, with or without a route prefix such as
    /// `/api/prompt`.
    pub fn new(base_url: impl Into<String>) -> CoreResult<Self> {
        Ok(Self::with_http(HttpClient::new_default()?, base_url))
    }

    pub fn with_http(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: http.labeled(Self::LABEL),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `POST /optimize`. `purpose` is folded into the prompt before sending.
    pub async fn optimize(&self, req: &OptimizeRequest) -> CoreResult<String> {
        let body = req.clone().fold_purpose();
        let (resp, _, _) = self
            .http
            .post_json::<_, OptimizeResponse>(&self.url("/optimize"), &body, &[])
            .await?;
        Ok(resp.optimized_prompt)
    }

    /// `POST /optimize/stream`, delivering each decoded chunk to `on_chunk`.
    ///
    /// Returns immediately; the request runs on a spawned task, so this must
    /// be called from within a Tokio runtime. `on_chunk` sees at most one
    /// terminal chunk and is never called after [`StreamController::abort`].
    /// Dropping the controller does not abort the request.
    pub fn optimize_stream<F>(&self, req: OptimizeRequest, on_chunk: F) -> StreamController
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = consume(
            self.http.clone(),
            self.url("/optimize/stream"),
            req.fold_purpose(),
            cancel.clone(),
            on_chunk,
        );
        StreamController { cancel, handle: Some(tokio::spawn(task)) }
    }
}

/// Handle to one in-flight streaming request.
#[derive(Debug)]
pub struct StreamController {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamController {
    /// Stop reading and drop the connection. Not reported to the callback.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait until the request task has ended (terminal chunk, failure or
    /// abort). Returns immediately once it has been observed to end.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "stream consumer task failed");
            }
            self.handle = None;
        }
    }
}

/// Terminal chunk for a request the relay refused or could not be reached.
fn open_failure_chunk(err: &RelayError) -> StreamChunk {
    match err {
        // relay answered with an error body: surface its message as-is
        RelayError::ProviderError { status, message, .. } => {
            StreamChunk::failed(message.clone(), Some(*status))
        }
        other => StreamChunk::from_error(other),
    }
}

async fn consume<F>(
    http: HttpClient,
    url: String,
    req: OptimizeRequest,
    cancel: CancellationToken,
    mut on_chunk: F,
) where
    F: FnMut(StreamChunk) + Send + 'static,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = http.post_sse(&url, &req, &[]) => res,
    };
    let mut frames: SseStream = match opened {
        Ok(frames) => frames,
        Err(e) => {
            if !cancel.is_cancelled() {
                on_chunk(open_failure_chunk(&e));
            }
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("stream aborted by caller");
                return;
            }
            next = frames.next() => next,
        };
        if cancel.is_cancelled() {
            return;
        }
        match next {
            Some(Ok(frame)) => match frame.parse_chunk() {
                Ok(chunk) => {
                    let terminal = chunk.is_terminal();
                    on_chunk(chunk);
                    if terminal {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed stream frame"),
            },
            Some(Err(e)) => {
                on_chunk(StreamChunk::from_error(&e));
                return;
            }
            None => {
                on_chunk(StreamChunk::failed("stream ended before completion", Some(502)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<StreamChunk>>>;

    fn recorder() -> (Seen, impl FnMut(StreamChunk) + Send + 'static) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |c| sink.lock().unwrap().push(c))
    }

    async fn stream_body(body: &str) -> Vec<StreamChunk> {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/optimize/stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;
        let client = RelayClient::new(server.base_url()).unwrap();
        let (seen, cb) = recorder();
        client.optimize_stream(OptimizeRequest::new("hi"), cb).wait().await;
        let out = seen.lock().unwrap().clone();
        out
    }

    #[tokio::test]
    async fn delivers_chunks_in_order_and_stops_at_terminal() {
        let body = concat!(
            "data: {\"chunk\":\"Hel\",\"complete\":false}\n\n",
            "data: {\"chunk\":\"lo\",\"complete\":false}\n\n",
            "data: {\"chunk\":\"\",\"complete\":true,\"fullResponse\":\"Hello\"}\n\n",
            "data: {\"chunk\":\"late\",\"complete\":false}\n\n",
        );
        let seen = stream_body(body).await;
        assert_eq!(
            seen,
            vec![
                StreamChunk::delta("Hel"),
                StreamChunk::delta("lo"),
                StreamChunk::completed("Hello"),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let body = concat!(
            "data: {\"chunk\":\"a\",\"complete\":false}\n\n",
            "data: {broken\n\n",
            "data: {\"chunk\":\"\",\"complete\":true,\"fullResponse\":\"a\"}\n\n",
        );
        let seen = stream_body(body).await;
        assert_eq!(seen, vec![StreamChunk::delta("a"), StreamChunk::completed("a")]);
    }

    #[tokio::test]
    async fn error_chunk_is_terminal() {
        let body = concat!(
            "data: {\"chunk\":\"a\",\"complete\":false}\n\n",
            "data: {\"chunk\":\"\",\"complete\":true,\"error\":\"rate limited\",\"statusCode\":429}\n\n",
        );
        let seen = stream_body(body).await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].error.as_deref(), Some("rate limited"));
        assert_eq!(seen[1].status_code, Some(429));
    }

    #[tokio::test]
    async fn end_of_body_without_terminal_reports_failure() {
        let seen = stream_body("data: {\"chunk\":\"a\",\"complete\":false}\n\n").await;
        assert_eq!(seen.len(), 2);
        assert!(seen[1].complete);
        assert!(seen[1].error.is_some());
        assert!(seen[1].full_response.is_none());
    }

    #[tokio::test]
    async fn unterminated_final_frame_is_still_delivered() {
        let seen = stream_body("data: {\"chunk\":\"\",\"complete\":true,\"fullResponse\":\"x\"}").await;
        assert_eq!(seen, vec![StreamChunk::completed("x")]);
    }

    #[tokio::test]
    async fn error_response_becomes_single_terminal_chunk() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/optimize/stream");
                then.status(400)
                    .json_body(json!({"error": "Prompt is required", "optimizedPrompt": null}));
            })
            .await;
        let client = RelayClient::new(server.base_url()).unwrap();
        let (seen, cb) = recorder();
        client.optimize_stream(OptimizeRequest::new(""), cb).wait().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![StreamChunk::failed("Prompt is required", Some(400))]);
    }

    #[tokio::test]
    async fn unreachable_relay_reports_transport_failure() {
        let client = RelayClient::new("http://127.0.0.1:9").unwrap();
        let (seen, cb) = recorder();
        client.optimize_stream(OptimizeRequest::new("hi"), cb).wait().await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status_code, Some(502));
    }

    #[tokio::test]
    async fn abort_stops_without_callback() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/optimize/stream");
                then.status(200)
                    .delay(Duration::from_secs(5))
                    .body("data: {\"chunk\":\"\",\"complete\":true,\"fullResponse\":\"x\"}\n\n");
            })
            .await;
        let client = RelayClient::new(server.base_url()).unwrap();
        let (seen, cb) = recorder();
        let mut ctl = client.optimize_stream(OptimizeRequest::new("hi"), cb);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctl.abort();
        assert!(ctl.is_aborted());
        tokio::time::timeout(Duration::from_secs(2), ctl.wait())
            .await
            .expect("abort must end the task promptly");
        assert!(seen.lock().unwrap().is_empty());
        assert!(ctl.is_finished());
    }

    #[tokio::test]
    async fn optimize_folds_purpose_and_returns_text() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/prompt/optimize")
                    .body_contains("Purpose: marketing")
                    .body_contains("\"prompt\"");
                then.status(200).json_body(json!({"optimizedPrompt": "better"}));
            })
            .await;
        let client = RelayClient::new(format!("{}/api/prompt/", server.base_url())).unwrap();
        let out = client
            .optimize(&OptimizeRequest::new("sell shoes").with_purpose("marketing"))
            .await
            .unwrap();
        assert_eq!(out, "better");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn optimize_error_carries_relay_message_and_status() {
        let server = MockServer::start_async().await;
        let _m = server
            .mock_async(|when, then| {
                when.method(POST).path("/optimize");
                then.status(504)
                    .json_body(json!({"error": "request timed out", "optimizedPrompt": null}));
            })
            .await;
        let client = RelayClient::new(server.base_url()).unwrap();
        let err = client.optimize(&OptimizeRequest::new("hi")).await.unwrap_err();
        match err {
            RelayError::ProviderError { status, message, .. } => {
                assert_eq!(status, 504);
                assert_eq!(message, "request timed out");
            }
            other => panic!("expected ProviderError, got: {:?}", other),
        }
    }
}
