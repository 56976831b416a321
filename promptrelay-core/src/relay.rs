//! Server side of the streaming relay.
//!
//! A [`RelaySession`] drives one upstream increment stream into a
//! [`ChunkSink`]. Session state moves `Open -> Streaming` and ends in exactly
//! one of `Completed`, `Errored` or `Aborted`:
//!
//! * `Completed` writes one `{complete: true, fullResponse}` chunk.
//! * `Errored` writes one `{error, statusCode, complete: true}` chunk.
//! * `Aborted` (downstream went away) writes nothing more.
//!
//! The downstream `closed()` future and the session's cancellation token are
//! raced against every upstream await, and checked again before every write.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{field, Instrument};

use crate::error::{CoreResult, RelayError};
use crate::sse::encode_frame;
use crate::stream::{IncrementStream, StreamChunk};
use crate::telemetry::{self, RelayLog, RelayMode};

/// The downstream side went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Downstream of a relay session.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Write one chunk. `Err` means the receiver is gone.
    async fn send(&mut self, chunk: StreamChunk) -> Result<(), Disconnected>;

    fn is_closed(&self) -> bool;

    /// Resolves once the receiver is gone.
    async fn closed(&self);
}

/// Sink writing encoded SSE frames into a channel, typically drained by an
/// HTTP response body.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn send(&mut self, chunk: StreamChunk) -> Result<(), Disconnected> {
        let frame = match encode_frame(&chunk) {
            Ok(f) => f,
            Err(e) => {
                // serializing a StreamChunk cannot fail in practice
                tracing::error!(error = %e, "dropping unencodable chunk");
                return Ok(());
            }
        };
        self.tx.send(frame).await.map_err(|_| Disconnected)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Streaming,
    Completed,
    Errored,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Per-request relay state. Owned by the task serving the request.
#[derive(Debug)]
pub struct RelaySession {
    id: String,
    model: String,
    buffer: String,
    disconnected: bool,
    state: SessionState,
    writes: u32,
    cancel: CancellationToken,
    started: Instant,
}

impl RelaySession {
    pub fn new(model: impl Into<String>) -> Self {
        let n = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("rs-{n}"),
            model: model.into(),
            buffer: String::new(),
            disconnected: false,
            state: SessionState::Open,
            writes: 0,
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cancelling this token has the same effect as a downstream disconnect.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(!self.state.is_terminal(), "transition out of {:?}", self.state);
        tracing::trace!(from = self.state.as_str(), to = next.as_str(), "relay state");
        self.state = next;
    }

    fn mark_disconnected(&mut self) {
        if !self.disconnected {
            tracing::debug!(session_id = %self.id, "downstream disconnected");
        }
        self.disconnected = true;
    }

    /// Write unless the downstream is known to be gone. Returns whether the
    /// chunk was written.
    async fn write<S: ChunkSink + ?Sized>(&mut self, sink: &mut S, chunk: StreamChunk) -> bool {
        if self.disconnected || self.cancel.is_cancelled() || sink.is_closed() {
            self.mark_disconnected();
            return false;
        }
        match sink.send(chunk).await {
            Ok(()) => {
                self.writes += 1;
                true
            }
            Err(Disconnected) => {
                self.mark_disconnected();
                false
            }
        }
    }

    async fn push_increment<S: ChunkSink + ?Sized>(&mut self, sink: &mut S, text: String) {
        if text.is_empty() {
            return;
        }
        self.buffer.push_str(&text);
        self.write(sink, StreamChunk::delta(text)).await;
    }

    async fn finish_completed<S: ChunkSink + ?Sized>(mut self, sink: &mut S) -> RelayReport {
        let terminal = StreamChunk::completed(self.buffer.clone());
        if self.write(sink, terminal).await {
            self.transition(SessionState::Completed);
        } else {
            self.transition(SessionState::Aborted);
        }
        self.into_report(None)
    }

    async fn finish_errored<S: ChunkSink + ?Sized>(
        mut self,
        sink: &mut S,
        err: RelayError,
    ) -> RelayReport {
        if self.write(sink, StreamChunk::from_error(&err)).await {
            tracing::warn!(session_id = %self.id, kind = err.kind(), error = %err, "relay failed");
            self.transition(SessionState::Errored);
            self.into_report(Some(err))
        } else {
            tracing::debug!(session_id = %self.id, error = %err, "upstream error after disconnect");
            self.transition(SessionState::Aborted);
            self.into_report(None)
        }
    }

    fn finish_aborted(mut self) -> RelayReport {
        self.mark_disconnected();
        self.transition(SessionState::Aborted);
        self.into_report(None)
    }

    fn into_report(self, error: Option<RelayError>) -> RelayReport {
        RelayReport {
            session_id: self.id,
            model: self.model,
            state: self.state,
            writes: self.writes,
            full_text: self.buffer,
            latency_ms: self.started.elapsed().as_millis() as u64,
            error,
        }
    }
}

/// Outcome of one relay session.
#[derive(Debug)]
pub struct RelayReport {
    pub session_id: String,
    pub model: String,
    pub state: SessionState,
    /// Chunks written downstream, terminal chunk included.
    pub writes: u32,
    /// Concatenation of the relayed increments (partial unless completed).
    pub full_text: String,
    pub latency_ms: u64,
    /// Set only for `Errored`.
    pub error: Option<RelayError>,
}

impl RelayReport {
    fn to_log(&self) -> RelayLog {
        let mut log = RelayLog::new(RelayMode::Stream)
            .session_id(&self.session_id)
            .model(&self.model)
            .outcome(self.state.as_str())
            .chunks(self.writes)
            .response_len(self.full_text.len())
            .latency_ms(self.latency_ms);
        match &self.error {
            Some(e) => log = log.error(e),
            None if self.state == SessionState::Completed => log = log.status_code(200),
            None => {}
        }
        log
    }
}

/// Relay one upstream stream into `sink`.
///
/// `open` starts the upstream call. A failure there ends the session as
/// `Errored` with a single terminal error chunk, same as a failure while
/// consuming.
pub async fn run<F, S>(session: RelaySession, open: F, sink: &mut S) -> RelayReport
where
    F: Future<Output = CoreResult<IncrementStream>> + Send,
    S: ChunkSink + ?Sized,
{
    let span = tracing::info_span!(
        "relay_session",
        session_id = %session.id,
        model = %session.model,
        outcome = field::Empty,
        chunks = field::Empty,
    );
    let report = drive(session, open, sink).instrument(span.clone()).await;
    span.record("outcome", report.state.as_str());
    span.record("chunks", report.writes);
    span.in_scope(|| {
        tracing::info!(
            latency_ms = report.latency_ms,
            response_len = report.full_text.len(),
            "relay finished"
        )
    });
    telemetry::emit(report.to_log());
    report
}

async fn drive<F, S>(mut session: RelaySession, open: F, sink: &mut S) -> RelayReport
where
    F: Future<Output = CoreResult<IncrementStream>> + Send,
    S: ChunkSink + ?Sized,
{
    let cancel = session.cancel.clone();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = sink.closed() => None,
        res = open => Some(res),
    };
    let mut upstream = match opened {
        None => return session.finish_aborted(),
        Some(Err(e)) => return session.finish_errored(sink, e).await,
        Some(Ok(s)) => s,
    };
    session.transition(SessionState::Streaming);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return session.finish_aborted(),
            _ = sink.closed() => return session.finish_aborted(),
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(text)) => {
                session.push_increment(sink, text).await;
                if session.disconnected {
                    return session.finish_aborted();
                }
            }
            Some(Err(e)) => return session.finish_errored(sink, e).await,
            None => return session.finish_completed(sink).await,
        }
    }
}
