use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::model::{ChatRequest, ChatResponse};
use crate::provider::ChatProvider;
use crate::providers::deepseek::DeepSeek;
use crate::stream::IncrementStream;

/// Environment accessor, injectable so tests never touch process state.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds the concrete upstream provider on first use.
///
/// Wiring a `LazyProvider` never fails: a missing API key only shows up as
/// `RelayError::MissingCredentials` from the first `chat`/`chat_stream`
/// call. A failed build is not cached, so the key is re-read on the next
/// call.
pub struct LazyProvider {
    cfg: Config,
    lookup: EnvLookup,
    cell: OnceCell<Arc<dyn ChatProvider>>,
}

impl LazyProvider {
    pub fn from_config(cfg: Config) -> Self {
        Self::with_lookup(cfg, Arc::new(|k: &str| std::env::var(k).ok()))
    }

    pub fn with_lookup(cfg: Config, lookup: EnvLookup) -> Self {
        Self {
            cfg,
            lookup,
            cell: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    fn provider(&self) -> CoreResult<&Arc<dyn ChatProvider>> {
        self.cell.get_or_try_init(|| {
            let key = self
                .cfg
                .upstream
                .resolve_api_key_with(|k| (self.lookup)(k))?;
            let http = HttpClient::new(&self.cfg.http)?.labeled(DeepSeek::NAME);
            tracing::debug!(base = %self.cfg.upstream.base_url, "upstream client initialized");
            let provider: Arc<dyn ChatProvider> =
                Arc::new(DeepSeek::new(http, key, self.cfg.upstream.base_url.clone()));
            Ok(provider)
        })
    }
}

#[async_trait]
impl ChatProvider for LazyProvider {
    fn name(&self) -> &str {
        DeepSeek::NAME
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        self.provider()?.chat(req).await
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<IncrementStream> {
        self.provider()?.chat_stream(req).await
    }
}
