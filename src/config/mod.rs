use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::warn;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Proxy directory configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Directory endpoint; unset means direct connections only.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Pause between directory polls. Non-numeric values fall back to the default.
    #[serde(default = "default_delay_ms", deserialize_with = "lenient_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_poll_connect_timeout_ms")]
    pub poll_connect_timeout_ms: u64,

    #[serde(default = "default_poll_read_timeout_ms")]
    pub poll_read_timeout_ms: u64,
}

/// Per-proxy connection pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_true")]
    pub cookie_store: bool,

    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

/// Retry engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Hard bound on a single attempt, body included.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Maximum attempts in flight across all callers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_DELAY_MS: u64 = 5000;

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}
fn default_poll_connect_timeout_ms() -> u64 {
    1000
}
fn default_poll_read_timeout_ms() -> u64 {
    4000
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_read_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_pool_max_idle() -> usize {
    32
}
fn default_pool_idle_timeout_secs() -> u64 {
    90
}
fn default_true() -> bool {
    true
}
fn default_attempt_timeout_ms() -> u64 {
    60_000
}
fn default_workers() -> usize {
    64
}
fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36 Edg/124.0",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
pub fn default_block_markers() -> Vec<String> {
    vec![
        "ERROR: The requested URL could not be retrieved".to_string(),
        "ERR_ACCESS_DENIED".to_string(),
    ]
}

/// Accepts `5000`, `"5000"`; anything else becomes the default delay.
fn lenient_delay_ms<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse().unwrap_or(DEFAULT_DELAY_MS),
        Raw::Other(_) => DEFAULT_DELAY_MS,
    })
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            delay_ms: default_delay_ms(),
            poll_connect_timeout_ms: default_poll_connect_timeout_ms(),
            poll_read_timeout_ms: default_poll_read_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            accept_invalid_certs: false,
            cookie_store: true,
            user_agents: default_user_agents(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_delay_ms: 0,
            workers: default_workers(),
            block_markers: default_block_markers(),
        }
    }
}

impl ProxyConfig {
    /// The directory URL, if one is actually configured.
    pub fn directory_url(&self) -> Option<&str> {
        self.api_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl EngineConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("FETCH").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|e| {
            warn!("Invalid configuration ({}), using defaults", e);
            AppConfig::default()
        });
        Ok(app_cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_lenient() {
        let cfg: ProxyConfig = serde_json::from_str(r#"{"delay_ms": 250}"#).unwrap();
        assert_eq!(cfg.delay_ms, 250);

        let cfg: ProxyConfig = serde_json::from_str(r#"{"delay_ms": "750"}"#).unwrap();
        assert_eq!(cfg.delay_ms, 750);

        let cfg: ProxyConfig = serde_json::from_str(r#"{"delay_ms": "soon"}"#).unwrap();
        assert_eq!(cfg.delay_ms, DEFAULT_DELAY_MS);

        let cfg: ProxyConfig = serde_json::from_str(r#"{"delay_ms": -3}"#).unwrap();
        assert_eq!(cfg.delay_ms, DEFAULT_DELAY_MS);

        let cfg: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.delay_ms, DEFAULT_DELAY_MS);
    }

    #[test]
    fn test_directory_url_blank_is_unset() {
        let mut cfg = ProxyConfig::default();
        assert_eq!(cfg.directory_url(), None);
        cfg.api_url = Some("   ".into());
        assert_eq!(cfg.directory_url(), None);
        cfg.api_url = Some(" http://dir.local/get ".into());
        assert_eq!(cfg.directory_url(), Some("http://dir.local/get"));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"engine": {"workers": 4}, "transport": {"cookie_store": false}}"#)
                .unwrap();
        assert_eq!(cfg.engine.workers, 4);
        assert_eq!(cfg.engine.attempt_timeout_ms, 60_000);
        assert_eq!(cfg.engine.block_markers, default_block_markers());
        assert!(!cfg.transport.cookie_store);
        assert_eq!(cfg.transport.connect_timeout_ms, 3000);
        assert!(cfg.proxy.api_url.is_none());
    }
}
