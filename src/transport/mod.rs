//! Transports: pooled HTTP clients bound to one exit address.
//!
//! A reqwest `Client` carries its proxy at construction, so rotating the proxy
//! means building a new transport. Dropping the last handle to a transport
//! releases its connection pool.

use crate::config::{ProxyConfig, TransportConfig};
use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, ProxyAddress, ProxyBinding, RawResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::seq::IndexedRandom;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

// ── Seams ─────────────────────────────────────────────────────────────────────

/// One connection pool, bound to the proxy it was built for.
#[async_trait]
pub trait Transport: Send + Sync {
    fn proxy(&self) -> Option<&ProxyAddress>;

    /// Execute once and buffer the whole body.
    async fn execute(&self, request: &FetchRequest) -> Result<RawResponse>;

    /// Execute once and hand back the body as it arrives.
    async fn execute_stream(&self, request: &FetchRequest) -> Result<ByteStream>;
}

/// Builds a transport for a given exit address (`None` = direct).
pub trait TransportFactory: Send + Sync {
    fn build(&self, proxy: Option<&ProxyAddress>) -> Result<Arc<dyn Transport>>;
}

// ── reqwest implementation ────────────────────────────────────────────────────

pub struct ReqwestTransportFactory {
    config: TransportConfig,
}

impl ReqwestTransportFactory {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn build(&self, proxy: Option<&ProxyAddress>) -> Result<Arc<dyn Transport>> {
        let client = build_client(&self.config, proxy)?;
        debug!(proxy = ?proxy.map(|p| p.to_string()), "built transport");
        Ok(Arc::new(ReqwestTransport {
            client,
            proxy: proxy.cloned(),
            config: self.config.clone(),
        }))
    }
}

/// Build a pooled client. Content decoding is left to the decoder, so the
/// client's own gzip handling is switched off.
pub fn build_client(
    config: &TransportConfig,
    proxy: Option<&ProxyAddress>,
) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .read_timeout(Duration::from_millis(config.read_timeout_ms))
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .cookie_store(config.cookie_store)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .gzip(false);

    let builder = match proxy {
        Some(p) => builder.proxy(reqwest::Proxy::all(p.to_url())?),
        None => builder.no_proxy(),
    };

    Ok(builder.build()?)
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    proxy: Option<ProxyAddress>,
    config: TransportConfig,
}

impl ReqwestTransport {
    /// The pooled client when the binding matches this transport, otherwise a
    /// one-off client for the binding (a pinned proxy is never overridden).
    fn client_for(&self, binding: &ProxyBinding) -> Result<reqwest::Client> {
        let wanted = binding.proxy();
        if *binding == ProxyBinding::Inherit || wanted == self.proxy.as_ref() {
            Ok(self.client.clone())
        } else {
            debug!(proxy = ?wanted.map(|p| p.to_string()), "one-off client for pinned binding");
            build_client(&self.config, wanted)
        }
    }

    /// `accept_gzip` is off for streamed bodies: they reach the caller as
    /// sent, without a decoder in between.
    fn prepare(
        &self,
        client: &reqwest::Client,
        request: &FetchRequest,
        accept_gzip: bool,
    ) -> reqwest::RequestBuilder {
        let mut builder = client.request(request.method.clone(), request.url.trim());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.has_header("user-agent") {
            builder = builder.header(USER_AGENT, random_user_agent(&self.config.user_agents));
        }
        if accept_gzip && !request.has_header("accept-encoding") {
            builder = builder.header(ACCEPT_ENCODING, "gzip");
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn proxy(&self) -> Option<&ProxyAddress> {
        self.proxy.as_ref()
    }

    async fn execute(&self, request: &FetchRequest) -> Result<RawResponse> {
        let client = self.client_for(&request.binding)?;
        let resp = self
            .prepare(&client, request, true)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let content_encoding = header_str(resp.headers(), CONTENT_ENCODING);
        let content_type = header_str(resp.headers(), CONTENT_TYPE);
        let body = resp.bytes().await?;

        Ok(RawResponse {
            status,
            content_encoding,
            content_type,
            body,
        })
    }

    async fn execute_stream(&self, request: &FetchRequest) -> Result<ByteStream> {
        let client = self.client_for(&request.binding)?;
        let resp = self
            .prepare(&client, request, false)
            .send()
            .await
            .map_err(classify)?;
        debug!(status = resp.status().as_u16(), url = %request.url, "streaming body");

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed())
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Builder failures mean the request itself is bad; everything else is the
/// network's fault.
fn classify(e: reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::InvalidRequest(e.to_string())
    } else {
        FetchError::Transport(e)
    }
}

pub fn random_user_agent(pool: &[String]) -> &str {
    pool.choose(&mut rand::rng())
        .map(String::as_str)
        .unwrap_or(FALLBACK_USER_AGENT)
}

// ── One-shot direct client ────────────────────────────────────────────────────

/// Short-timeout client for one-off GETs, such as polling the proxy directory.
/// Not pooled per proxy and never retried.
pub struct DirectClient {
    client: reqwest::Client,
    connect_timeout: Duration,
    read_timeout: Duration,
    user_agents: Vec<String>,
}

impl DirectClient {
    pub fn new(proxy: &ProxyConfig, transport: &TransportConfig) -> Result<Self> {
        let connect_timeout = Duration::from_millis(proxy.poll_connect_timeout_ms);
        let read_timeout = Duration::from_millis(proxy.poll_read_timeout_ms);
        Ok(Self {
            client: Self::client(connect_timeout, read_timeout, None)?,
            connect_timeout,
            read_timeout,
            user_agents: transport.user_agents.clone(),
        })
    }

    fn client(
        connect_timeout: Duration,
        read_timeout: Duration,
        proxy: Option<&ProxyAddress>,
    ) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .gzip(true);
        let builder = match proxy {
            Some(p) => builder.proxy(reqwest::Proxy::all(p.to_url())?),
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }

    /// GET `url` once and return the body as UTF-8 text. Non-2xx is an error.
    pub async fn get_once(&self, url: &str, proxy: Option<&ProxyAddress>) -> Result<String> {
        let client = match proxy {
            Some(p) => Self::client(self.connect_timeout, self.read_timeout, Some(p))?,
            None => self.client.clone(),
        };

        let resp = client
            .get(url)
            .header(USER_AGENT, random_user_agent(&self.user_agents))
            .send()
            .await
            .map_err(classify)?
            .error_for_status()?;

        let bytes = resp.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
