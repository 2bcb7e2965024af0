//! The fetch engine: attempt → {accepted, rejected}, rejected → rotate → attempt.
//!
//! ## Retry model
//!
//! Every rejection looks the same to the engine. A dead proxy, a timeout,
//! a non-2xx status and a block page all lead to a proxy refresh and another
//! attempt. There is no attempt ceiling. A fetch against a target that never
//! answers acceptably runs until the caller drops the future or wraps it in
//! `tokio::time::timeout`.
//!
//! Only these stop the loop early:
//!   * a request without a usable URL (`Ok(None)`, nothing is sent)
//!   * an unsupported charset (retrying will not change the encoding)
//!   * a request the HTTP stack refuses to build
//!   * a closed engine
//!
//! ## Attempt execution
//!
//! Each attempt runs as a spawned task holding a worker permit, and the caller
//! waits on it with `tokio::time::timeout_at`. The deadline is set before the
//! permit is requested, so time spent queueing for a worker counts against the
//! attempt. When the deadline passes the task is aborted, which cancels the
//! network call at its next await point.

pub mod json;
pub mod predicate;

pub use predicate::{BlockPageDetector, ResponsePredicate};

use crate::config::AppConfig;
use crate::decoder;
use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, ProxyAddress, RawResponse};
use crate::proxy::{
    DirectoryProxySource, ProxyRotator, ProxySource, RefreshOutcome, RotatorStats,
};
use crate::transport::{ByteStream, DirectClient, ReqwestTransportFactory, Transport, TransportFactory};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WORKERS: usize = 64;

// ── Attempt outcomes ──────────────────────────────────────────────────────────

/// Why an attempt did not yield an accepted body.
#[derive(Debug, Error)]
enum Rejection {
    #[error("{0}")]
    Failed(FetchError),

    #[error("status {0}")]
    Status(u16),

    #[error("rejected by predicate")]
    Predicate,

    #[error("no JSON object in body: {0}")]
    Unparsable(serde_json::Error),
}

#[derive(Debug)]
enum AttemptError {
    /// Rotate and go again.
    Rejected(Rejection),
    /// Stop and surface to the caller.
    Fatal(FetchError),
}

impl AttemptError {
    fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    fn into_error(self) -> FetchError {
        match self {
            Self::Fatal(e) | Self::Rejected(Rejection::Failed(e)) => e,
            Self::Rejected(other) => FetchError::Rejected(other.to_string()),
        }
    }
}

impl From<FetchError> for AttemptError {
    fn from(e: FetchError) -> Self {
        if e.is_retryable() {
            Self::Rejected(Rejection::Failed(e))
        } else {
            Self::Fatal(e)
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct EngineBuilder {
    source: Arc<dyn ProxySource>,
    factory: Arc<dyn TransportFactory>,
    attempt_timeout: Duration,
    retry_delay: Duration,
    workers: usize,
    predicate: Arc<dyn ResponsePredicate>,
}

impl EngineBuilder {
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Pause between a rejection and the next attempt. Zero by default.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Predicate used by [`FetchEngine::fetch`].
    pub fn predicate(mut self, predicate: impl ResponsePredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Acquires the first proxy, so this blocks as long as the source does.
    pub async fn build(self) -> Result<FetchEngine> {
        let rotator = ProxyRotator::connect(self.source, self.factory).await?;
        Ok(FetchEngine {
            rotator,
            workers: Arc::new(Semaphore::new(self.workers)),
            attempt_timeout: self.attempt_timeout,
            retry_delay: self.retry_delay,
            predicate: self.predicate,
        })
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Shared fetch client. Clone the surrounding `Arc` to hand it to tasks.
pub struct FetchEngine {
    rotator: ProxyRotator,
    workers: Arc<Semaphore>,
    attempt_timeout: Duration,
    retry_delay: Duration,
    predicate: Arc<dyn ResponsePredicate>,
}

impl FetchEngine {
    pub fn builder(
        source: Arc<dyn ProxySource>,
        factory: Arc<dyn TransportFactory>,
    ) -> EngineBuilder {
        EngineBuilder {
            source,
            factory,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry_delay: Duration::ZERO,
            workers: DEFAULT_WORKERS,
            predicate: Arc::new(BlockPageDetector::default()),
        }
    }

    /// Production wiring: directory source, reqwest transports.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let directory = DirectClient::new(&config.proxy, &config.transport)?;
        let source = Arc::new(DirectoryProxySource::from_config(&config.proxy, directory));
        let factory = Arc::new(ReqwestTransportFactory::new(&config.transport));

        Self::builder(source, factory)
            .attempt_timeout(config.engine.attempt_timeout())
            .retry_delay(config.engine.retry_delay())
            .workers(config.engine.workers)
            .predicate(BlockPageDetector::new(config.engine.block_markers.clone()))
            .build()
            .await
    }

    /// Fetch with the engine's default predicate.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Option<String>> {
        self.fetch_with(request, Some(&*self.predicate)).await
    }

    /// Fetch until a 2xx response passes `predicate` (`None`: status only).
    pub async fn fetch_with(
        &self,
        request: &FetchRequest,
        predicate: Option<&dyn ResponsePredicate>,
    ) -> Result<Option<String>> {
        if !request.has_target() {
            warn!(url = %request.url, "url is empty or invalid, not fetching");
            return Ok(None);
        }

        let mut attempt = 0u32;
        let outcome = RetryIf::spawn(
            self.retry_strategy(),
            || {
                attempt += 1;
                self.attempt(request, predicate, attempt)
            },
            |e: &AttemptError| e.is_rejection(),
        )
        .await;

        outcome.map(Some).map_err(AttemptError::into_error)
    }

    /// Single attempt, raw body as it arrives. No retry, no decoding, and no
    /// compression is requested on the caller's behalf.
    pub async fn fetch_as_stream(&self, request: &FetchRequest) -> Result<Option<ByteStream>> {
        if !request.has_target() {
            warn!(url = %request.url, "url is empty or invalid, not streaming");
            return Ok(None);
        }

        let (proxy, transport) = self.rotator.active()?;
        let bound = request.bind(proxy.as_ref());
        let stream = tokio::time::timeout(self.attempt_timeout, transport.execute_stream(&bound))
            .await
            .map_err(|_| FetchError::Timeout(self.attempt_timeout))??;
        Ok(Some(stream))
    }

    /// GET `url` and parse the JSON object embedded between `prefix` and
    /// `suffix`. A body without a parsable object counts as a rejection.
    pub async fn fetch_as_json(
        &self,
        url: &str,
        prefix: Option<&str>,
        suffix: Option<&str>,
    ) -> Result<Option<Map<String, Value>>> {
        let request = FetchRequest::get(url);
        if !request.has_target() {
            warn!(url, "url is empty or invalid, not fetching");
            return Ok(None);
        }

        RetryIf::spawn(
            self.retry_strategy(),
            || self.json_attempt(&request, prefix, suffix),
            |e: &AttemptError| e.is_rejection(),
        )
        .await
        .map(Some)
        .map_err(AttemptError::into_error)
    }

    pub async fn rotate_proxy_now(&self) -> Result<RefreshOutcome> {
        self.rotator.refresh().await
    }

    pub fn current_proxy(&self) -> Option<ProxyAddress> {
        self.rotator.current()
    }

    pub fn stats(&self) -> RotatorStats {
        self.rotator.stats()
    }

    /// Release the transport. Subsequent fetches fail with `Closed` until
    /// `reopen`.
    pub async fn close(&self) {
        self.rotator.close().await;
    }

    pub async fn reopen(&self) -> Result<RefreshOutcome> {
        self.rotator.reopen().await
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn retry_strategy(&self) -> FixedInterval {
        FixedInterval::new(self.retry_delay)
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        predicate: Option<&dyn ResponsePredicate>,
        attempt: u32,
    ) -> std::result::Result<String, AttemptError> {
        match self.try_once(request, predicate).await {
            Ok(text) => {
                if attempt > 1 {
                    info!(url = %request.url, attempt, "accepted after retries");
                }
                Ok(text)
            }
            Err(AttemptError::Rejected(reason)) => {
                debug!(url = %request.url, attempt, %reason, "attempt rejected, rotating proxy");
                self.rotator.refresh().await.map_err(AttemptError::Fatal)?;
                Err(AttemptError::Rejected(reason))
            }
            Err(fatal) => Err(fatal),
        }
    }

    async fn try_once(
        &self,
        request: &FetchRequest,
        predicate: Option<&dyn ResponsePredicate>,
    ) -> std::result::Result<String, AttemptError> {
        let (proxy, transport) = self.rotator.active().map_err(AttemptError::Fatal)?;
        let bound = request.bind(proxy.as_ref());

        let response = self.execute_bounded(transport, bound).await?;
        let accepted = response.is_success();
        let RawResponse {
            status,
            content_encoding,
            content_type,
            body,
        } = response;

        let text = decoder::decode(body, content_encoding.as_deref(), content_type.as_deref())
            .map_err(|e| AttemptError::from(FetchError::from(e)))?;

        if !accepted {
            return Err(AttemptError::Rejected(Rejection::Status(status)));
        }
        if predicate.is_some_and(|p| p.rejects(&text)) {
            return Err(AttemptError::Rejected(Rejection::Predicate));
        }
        Ok(text)
    }

    async fn execute_bounded(
        &self,
        transport: Arc<dyn Transport>,
        request: FetchRequest,
    ) -> Result<RawResponse> {
        let deadline = tokio::time::Instant::now() + self.attempt_timeout;

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.workers).acquire_owned())
            .await
            .map_err(|_| FetchError::Timeout(self.attempt_timeout))?
            .map_err(|_| FetchError::Closed)?;

        let mut task = tokio::spawn(async move {
            let _permit = permit;
            transport.execute(&request).await
        });

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(FetchError::TaskFailed(join.to_string())),
            Err(_) => {
                task.abort();
                Err(FetchError::Timeout(self.attempt_timeout))
            }
        }
    }

    async fn json_attempt(
        &self,
        request: &FetchRequest,
        prefix: Option<&str>,
        suffix: Option<&str>,
    ) -> std::result::Result<Map<String, Value>, AttemptError> {
        let body = self
            .fetch(request)
            .await
            .map_err(AttemptError::Fatal)?
            .ok_or_else(|| AttemptError::Fatal(FetchError::InvalidRequest(request.url.clone())))?;

        let cleaned = json::unescape_entities(&body);
        let parsed = serde_json::from_str::<Map<String, Value>>(json::extract(&cleaned, prefix, suffix));

        match parsed {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(url = %request.url, error = %e, "no JSON object in response, rotating proxy");
                debug!(%body, "unparsable body");
                self.rotator.refresh().await.map_err(AttemptError::Fatal)?;
                Err(AttemptError::Rejected(Rejection::Unparsable(e)))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
