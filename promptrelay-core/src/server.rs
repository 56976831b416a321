//! HTTP surface of the relay.
//!
//! `POST /optimize`, `POST /optimize/stream` (also under `/api/prompt`) and
//! `GET /health`.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderName, HeaderValue, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::{CoreResult, RelayError};
use crate::model::{ErrorBody, HealthResponse, OptimizeRequest, OptimizeResponse};
use crate::provider::ChatProvider;
use crate::provider_factory::LazyProvider;
use crate::relay::ChannelSink;
use crate::service::PromptService;

/// Frames buffered between a relay session and the response body.
const STREAM_BUFFER: usize = 32;

pub const API_PREFIX: &str = "/api/prompt";

/// Hardening headers added to every response that does not set its own.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src 'self';base-uri 'self';font-src 'self' https: data:;\
         form-action 'self';frame-ancestors 'self';img-src 'self' data:;\
         object-src 'none';script-src 'self';script-src-attr 'none';\
         style-src 'self' https: 'unsafe-inline';upgrade-insecure-requests",
    ),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("origin-agent-cluster", "?1"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

/// Application state shared across routes.
#[derive(Clone)]
pub struct AppState {
    service: PromptService,
}

impl AppState {
    pub fn new(service: PromptService) -> Self {
        Self { service }
    }

    /// Wire the DeepSeek provider lazily: a missing key surfaces on the first
    /// request, not here.
    pub fn from_config(cfg: &Config) -> Self {
        let provider: Arc<dyn ChatProvider> = Arc::new(LazyProvider::from_config(cfg.clone()));
        Self::new(PromptService::new(provider, cfg.upstream.model.clone()))
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/optimize", post(optimize))
        .route("/optimize/stream", post(optimize_stream));

    let mut app = Router::new()
        .route("/health", get(health))
        .merge(api.clone())
        .nest(API_PREFIX, api);
    for &(name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `cfg.server.bind` and serve until Ctrl-C.
pub async fn serve(cfg: &Config, state: AppState) -> CoreResult<()> {
    let listener = TcpListener::bind(&cfg.server.bind).await?;
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("relay listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string() })
}

fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody::new(err.to_string()))).into_response()
}

fn parse_body(
    payload: Result<Json<OptimizeRequest>, JsonRejection>,
) -> Result<OptimizeRequest, Response> {
    payload
        .map(|Json(req)| req)
        .map_err(|rej| error_response(&RelayError::Validation(rej.body_text())))
}

async fn optimize(
    State(state): State<AppState>,
    payload: Result<Json<OptimizeRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.service.optimize(&req).await {
        Ok(optimized_prompt) => Json(OptimizeResponse { optimized_prompt }).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn optimize_stream(
    State(state): State<AppState>,
    payload: Result<Json<OptimizeRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(payload) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let prepared = match state.service.prepare_stream(&req) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        prepared.relay(&mut sink).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}
