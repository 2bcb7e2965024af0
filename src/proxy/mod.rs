//! Proxy acquisition from an external directory endpoint.
//!
//! The directory answers `GET <url>` with either `{"success":false}` (nothing
//! available yet) or a single-entry object `{"<ip>": <port>}`.

pub mod rotator;

pub use rotator::{ProxyRotator, RefreshOutcome, RotatorStats};

use crate::config::ProxyConfig;
use crate::error::{FetchError, Result};
use crate::models::ProxyAddress;
use crate::transport::DirectClient;
use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, error, info};

const NOT_READY: &str = r#"{"success":false}"#;

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Hands out one exit address. `None` means connect directly.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn acquire(&self) -> Option<ProxyAddress>;
}

/// The raw HTTP call against the directory.
#[async_trait]
pub trait DirectoryFetch: Send + Sync {
    async fn fetch_directory(&self, url: &str) -> Result<String>;
}

#[async_trait]
impl<T: DirectoryFetch + ?Sized> DirectoryFetch for Arc<T> {
    async fn fetch_directory(&self, url: &str) -> Result<String> {
        (**self).fetch_directory(url).await
    }
}

#[async_trait]
impl DirectoryFetch for DirectClient {
    async fn fetch_directory(&self, url: &str) -> Result<String> {
        self.get_once(url, None).await
    }
}

/// Always direct.
pub struct NoProxy;

#[async_trait]
impl ProxySource for NoProxy {
    async fn acquire(&self) -> Option<ProxyAddress> {
        None
    }
}

// ── Directory source ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unavailable(#[from] FetchError),

    #[error("empty response")]
    Empty,

    #[error("response is not a JSON object")]
    NotJson,

    #[error("no proxy ready yet")]
    NotReady,

    #[error("malformed entry: {0}")]
    Malformed(String),
}

/// Polls the directory until it yields a usable address.
///
/// There is no retry ceiling: with a directory that never becomes ready,
/// `acquire` never returns. Wrap it in `tokio::time::timeout` when a bound
/// is needed.
pub struct DirectoryProxySource<F> {
    url: Option<String>,
    delay: Duration,
    fetcher: F,
}

impl<F: DirectoryFetch> DirectoryProxySource<F> {
    pub fn new(url: Option<&str>, delay: Duration, fetcher: F) -> Self {
        Self {
            url: url
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            delay,
            fetcher,
        }
    }

    pub fn from_config(config: &ProxyConfig, fetcher: F) -> Self {
        Self::new(config.directory_url(), config.delay(), fetcher)
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    async fn poll_once(&self, url: &str) -> std::result::Result<ProxyAddress, DirectoryError> {
        let body = self.fetcher.fetch_directory(url).await?;
        parse_directory_body(&body).inspect_err(|e| debug!("directory poll: {}", e))
    }
}

#[async_trait]
impl<F: DirectoryFetch> ProxySource for DirectoryProxySource<F> {
    async fn acquire(&self) -> Option<ProxyAddress> {
        let url = self.url.as_deref()?;

        // FixedInterval never runs dry, so this only resolves on success.
        match Retry::spawn(FixedInterval::new(self.delay), || self.poll_once(url)).await {
            Ok(addr) => {
                info!(proxy = %addr, "acquired proxy");
                Some(addr)
            }
            Err(e) => {
                error!("proxy directory polling stopped: {}", e);
                None
            }
        }
    }
}

/// Parse one directory response. The first key is the IP, its value the port.
pub fn parse_directory_body(body: &str) -> std::result::Result<ProxyAddress, DirectoryError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DirectoryError::Empty);
    }
    if !body.starts_with('{') {
        return Err(DirectoryError::NotJson);
    }
    if body == NOT_READY {
        return Err(DirectoryError::NotReady);
    }

    let entries: serde_json::Map<String, Value> =
        serde_json::from_str(body).map_err(|_| DirectoryError::NotJson)?;
    let Some((ip, port)) = entries.iter().next() else {
        return Err(DirectoryError::NotReady);
    };

    let host: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| DirectoryError::Malformed(format!("not an IP address: {:?}", ip)))?;

    let port = match port {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
    .ok_or_else(|| DirectoryError::Malformed(format!("bad port for {}: {}", ip, port)))?;

    Ok(ProxyAddress::new(host.to_string(), port as u16))
}
