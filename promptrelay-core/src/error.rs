use thiserror::Error;

/// Core error type for prompt-relay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Client mistake (e.g. empty prompt). Never reaches the upstream.
    #[error("{0}")]
    Validation(String),

    /// No API key could be resolved. Surfaced at first use, not at start-up.
    #[error("missing API credentials: set {env}")]
    MissingCredentials { env: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("upstream error from {provider}: {status} {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("request to {provider} timed out after {after_ms}ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("could not reach {provider}: {message}")]
    Transport { provider: String, message: String },

    #[error("no response content from {provider}")]
    EmptyResponse { provider: String },

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// HTTP-style status used for both JSON error bodies and terminal SSE chunks.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::MissingCredentials { .. } => 401,
            Self::RateLimited { .. } => 429,
            Self::ProviderError { status, .. } => *status,
            Self::Timeout { .. } => 504,
            Self::Transport { .. } | Self::EmptyResponse { .. } | Self::Decode(_) => 502,
            Self::Config(_) | Self::Io(_) | Self::Other(_) => 500,
        }
    }

    /// Stable short name for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::MissingCredentials { .. } => "missing_credentials",
            Self::Config(_) => "config",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderError { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::EmptyResponse { .. } => "empty_response",
            Self::Decode(_) => "decode",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;
