//! Scripted doubles for the network-facing seams.

use crate::error::{FetchError, Result};
use crate::models::{FetchRequest, ProxyAddress, RawResponse};
use crate::proxy::{DirectoryFetch, ProxySource};
use crate::transport::{ByteStream, Transport, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ── Directory ─────────────────────────────────────────────────────────────────

pub struct ScriptedDirectory {
    replies: Mutex<VecDeque<Result<String>>>,
    calls: AtomicUsize,
}

impl ScriptedDirectory {
    pub fn new(replies: impl IntoIterator<Item = Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryFetch for ScriptedDirectory {
    async fn fetch_directory(&self, _url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"success":false}"#.to_string()))
    }
}

// ── Proxy source ──────────────────────────────────────────────────────────────

/// Hands out addresses in order, repeating the last one once exhausted.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Option<ProxyAddress>>>,
    last: Mutex<Option<ProxyAddress>>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Option<ProxyAddress>>, latency: Duration) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            latency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxySource for ScriptedSource {
    async fn acquire(&self) -> Option<ProxyAddress> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.script.lock().pop_front();
        let addr = match next {
            Some(addr) => {
                *self.last.lock() = addr.clone();
                addr
            }
            None => self.last.lock().clone(),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        addr
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub enum Step {
    Fail,
    Hang(Duration),
    Respond(RawResponse),
}

impl Step {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::Respond(RawResponse {
            status,
            content_encoding: None,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: Bytes::from(body.to_string()),
        })
    }
}

/// Plays back steps in order; once exhausted every call answers 200 "ok".
/// Shared by every transport the fake factory builds.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    seen: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.seen.lock().clone()
    }

    async fn next(&self, request: &FetchRequest) -> Result<RawResponse> {
        self.seen.lock().push(request.clone());
        let step = self.steps.lock().pop_front().unwrap_or_else(|| Step::ok("ok"));
        match step {
            Step::Fail => Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted failure",
            ))),
            Step::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok(RawResponse {
                    status: 200,
                    content_encoding: None,
                    content_type: None,
                    body: Bytes::from_static(b"late"),
                })
            }
            Step::Respond(resp) => Ok(resp),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn proxy(&self) -> Option<&ProxyAddress> {
        None
    }

    async fn execute(&self, request: &FetchRequest) -> Result<RawResponse> {
        self.next(request).await
    }

    async fn execute_stream(&self, request: &FetchRequest) -> Result<ByteStream> {
        let resp = self.next(request).await?;
        let chunks: Vec<Result<Bytes>> = resp
            .body
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

pub struct FakeFactory {
    transport: Arc<ScriptedTransport>,
    builds: Mutex<Vec<Option<ProxyAddress>>>,
    fail_next: AtomicBool,
}

impl FakeFactory {
    pub fn new(transport: Arc<ScriptedTransport>) -> Self {
        Self {
            transport,
            builds: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn builds(&self) -> Vec<Option<ProxyAddress>> {
        self.builds.lock().clone()
    }

    pub fn fail_next_build(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TransportFactory for FakeFactory {
    fn build(&self, proxy: Option<&ProxyAddress>) -> Result<Arc<dyn Transport>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(FetchError::InvalidRequest("scripted build failure".into()));
        }
        self.builds.lock().push(proxy.cloned());
        Ok(self.transport.clone())
    }
}
