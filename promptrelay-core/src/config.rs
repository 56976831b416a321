use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, RelayError};

pub const ENV_API_KEY: &str = "DEEPSEEK_API_KEY";
/// Documented fallback when the primary key variable is unset.
pub const ENV_API_KEY_FALLBACK: &str = "OPENAI_API_KEY";
pub const ENV_BASE_URL: &str = "DEEPSEEK_API_BASE_URL";
pub const ENV_MODEL: &str = "DEEPSEEK_MODEL";
pub const ENV_TIMEOUT_MS: &str = "DEEPSEEK_TIMEOUT_MS";
pub const ENV_PORT: &str = "PORT";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Variables tried in order when `api_key_env` is unset or empty.
    #[serde(default = "default_fallback_key_envs")]
    pub fallback_key_envs: Vec<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            fallback_key_envs: default_fallback_key_envs(),
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    ENV_API_KEY.to_string()
}
fn default_fallback_key_envs() -> Vec<String> {
    vec![ENV_API_KEY_FALLBACK.to_string()]
}
fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl UpstreamCfg {
    /// Resolve the API key through `lookup` (usually `std::env::var`).
    /// Called lazily on the first upstream call so that wiring never fails
    /// just because the key is absent.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> CoreResult<SecretString>
    where
        F: Fn(&str) -> Option<String>,
    {
        let candidates = std::iter::once(&self.api_key_env).chain(self.fallback_key_envs.iter());
        for key in candidates {
            if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
                if key != &self.api_key_env {
                    tracing::warn!(primary = %self.api_key_env, fallback = %key, "API key not set, using fallback variable");
                }
                return Ok(SecretString::from(v));
            }
        }
        Err(RelayError::MissingCredentials {
            env: self.api_key_env.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on one upstream call in milliseconds (default 60000ms).
    /// For streaming calls it bounds opening the stream, not the whole session.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub server: ServerCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> CoreResult<Self> {
        Self::default().apply_process_env()
    }

    pub fn apply_process_env(self) -> CoreResult<Self> {
        self.apply_env_with(|k| std::env::var(k).ok())
    }

    /// Overlay environment values on top of `self`. The API key itself is not
    /// read here; see [`UpstreamCfg::resolve_api_key_with`].
    pub fn apply_env_with<F>(mut self, lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(base) = get(ENV_BASE_URL) {
            self.upstream.base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = get(ENV_MODEL) {
            self.upstream.model = model;
        }
        if let Some(ms) = get(ENV_TIMEOUT_MS) {
            self.http.request_timeout_ms = ms.trim().parse::<u64>().map_err(|_| {
                RelayError::Config(format!("{ENV_TIMEOUT_MS} is not a valid number: {ms}"))
            })?;
            if self.http.request_timeout_ms == 0 {
                return Err(RelayError::Config(format!("{ENV_TIMEOUT_MS} must be at least 1")));
            }
        }
        if let Some(port) = get(ENV_PORT) {
            let port = port.trim().parse::<u16>().map_err(|_| {
                RelayError::Config(format!("{ENV_PORT} is not a valid port: {port}"))
            })?;
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{host}:{port}");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.upstream.base_url, "https://api.deepseek.com");
        assert_eq!(cfg.upstream.model, "deepseek-chat");
        assert_eq!(cfg.upstream.api_key_env, "DEEPSEEK_API_KEY");
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.server.bind, "0.0.0.0:5000");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = Config::default()
            .apply_env_with(env(&[
                ("DEEPSEEK_API_BASE_URL", "http://localhost:9999/"),
                ("DEEPSEEK_MODEL", "deepseek-reasoner"),
                ("DEEPSEEK_TIMEOUT_MS", "1500"),
                ("PORT", "5001"),
            ]))
            .unwrap();
        assert_eq!(cfg.upstream.base_url, "http://localhost:9999");
        assert_eq!(cfg.upstream.model, "deepseek-reasoner");
        assert_eq!(cfg.http.request_timeout_ms, 1500);
        assert_eq!(cfg.server.bind, "0.0.0.0:5001");
    }

    #[test]
    fn from_env_overlays_process_environment() {
        let via_lookup = Config::default().apply_env_with(|k| std::env::var(k).ok());
        match (Config::from_env(), via_lookup) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
            (a, b) => panic!("from_env {a:?} disagrees with lookup {b:?}"),
        }
    }

    #[test]
    fn bad_timeout_is_config_error() {
        let err = Config::default()
            .apply_env_with(env(&[("DEEPSEEK_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got {err:?}");
    }

    #[test]
    fn api_key_prefers_primary_then_fallback() {
        let up = UpstreamCfg::default();
        let key = up
            .resolve_api_key_with(env(&[("DEEPSEEK_API_KEY", "primary"), ("OPENAI_API_KEY", "fb")]))
            .unwrap();
        assert_eq!(key.expose_secret(), "primary");

        let key = up
            .resolve_api_key_with(env(&[("DEEPSEEK_API_KEY", "  "), ("OPENAI_API_KEY", "fb")]))
            .unwrap();
        assert_eq!(key.expose_secret(), "fb");
    }

    #[test]
    fn missing_api_key_is_deferred_config_error() {
        let up = UpstreamCfg::default();
        let err = up.resolve_api_key_with(env(&[])).unwrap_err();
        match err {
            RelayError::MissingCredentials { env } => assert_eq!(env, "DEEPSEEK_API_KEY"),
            other => panic!("expected MissingCredentials, got: {:?}", other),
        }
    }

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        let json = r#"{
          "upstream": {"base_url": "http://127.0.0.1:8080", "model": "deepseek-chat"},
          "server": {"bind": "127.0.0.1:5001"}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.base_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.upstream.api_key_env, "DEEPSEEK_API_KEY");
        assert_eq!(cfg.server.bind, "127.0.0.1:5001");
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.toml");
        let toml = r#"
[upstream]
api_key_env = "MY_KEY"
fallback_key_envs = []
model = "deepseek-reasoner"

[http]
request_timeout_ms = 2500
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.upstream.api_key_env, "MY_KEY");
        assert!(cfg.upstream.fallback_key_envs.is_empty());
        assert_eq!(cfg.upstream.model, "deepseek-reasoner");
        assert_eq!(cfg.http.request_timeout_ms, 2500);
        assert_eq!(cfg.server.bind, "0.0.0.0:5000");
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/promptrelay-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            RelayError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            RelayError::Other(_) => {}
            other => panic!("expected Other(utf8) error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("relay.conf");
        fs::write(&json_path, r#"{"upstream":{"model":"m1"}}"#).unwrap();
        assert_eq!(Config::from_path(&json_path).unwrap().upstream.model, "m1");

        let toml_path = dir.path().join("relay2.conf");
        fs::write(&toml_path, "[upstream]\nmodel = \"m2\"\n").unwrap();
        assert_eq!(Config::from_path(&toml_path).unwrap().upstream.model, "m2");
    }
}
