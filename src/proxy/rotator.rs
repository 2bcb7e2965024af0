//! Ownership of the active exit address and the transport bound to it.
//!
//! Two locks:
//!   * `state` (parking_lot RwLock) guards the proxy/transport pair. It is only
//!     held for the swap itself, never across an await.
//!   * `turn` (tokio Mutex) serialises refresh against refresh and against
//!     close. Refresh only *tries* it: when a refresh is already running the
//!     caller skips, and the running one updates state for everyone.

use super::ProxySource;
use crate::error::{FetchError, Result};
use crate::models::ProxyAddress;
use crate::transport::{Transport, TransportFactory};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new address (or direct, `None`) was installed.
    Rotated(Option<ProxyAddress>),
    /// Another refresh held the lock; nothing was done.
    Skipped,
    /// The rotator has been closed.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotatorStats {
    pub refreshes: u64,
    pub skipped: u64,
}

struct ActiveProxy {
    proxy: Option<ProxyAddress>,
    transport: Option<Arc<dyn Transport>>,
    closed: bool,
}

pub struct ProxyRotator {
    source: Arc<dyn ProxySource>,
    factory: Arc<dyn TransportFactory>,
    state: RwLock<ActiveProxy>,
    turn: Mutex<()>,
    refreshes: AtomicU64,
    skipped: AtomicU64,
}

impl ProxyRotator {
    /// Acquire the first address and build its transport. Blocks for as long
    /// as the source does.
    pub async fn connect(
        source: Arc<dyn ProxySource>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let proxy = source.acquire().await;
        let transport = factory.build(proxy.as_ref())?;
        info!(proxy = ?proxy.as_ref().map(|p| p.to_string()), "rotator ready");

        Ok(Self {
            source,
            factory,
            state: RwLock::new(ActiveProxy {
                proxy,
                transport: Some(transport),
                closed: false,
            }),
            turn: Mutex::new(()),
            refreshes: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        })
    }

    pub fn current(&self) -> Option<ProxyAddress> {
        self.state.read().proxy.clone()
    }

    pub fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.state.read().transport.clone().ok_or(FetchError::Closed)
    }

    /// Proxy and transport read together, so they always belong to each other.
    pub fn active(&self) -> Result<(Option<ProxyAddress>, Arc<dyn Transport>)> {
        let state = self.state.read();
        let transport = state.transport.clone().ok_or(FetchError::Closed)?;
        Ok((state.proxy.clone(), transport))
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn stats(&self) -> RotatorStats {
        RotatorStats {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Replace the active address unless a refresh is already in flight.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Ok(_turn) = self.turn.try_lock() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("proxy refresh already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        };
        if self.is_closed() {
            return Ok(RefreshOutcome::Closed);
        }
        self.install().await
    }

    /// Re-initialise after `close`, or force a rotation on an open rotator.
    pub async fn reopen(&self) -> Result<RefreshOutcome> {
        let Ok(_turn) = self.turn.try_lock() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(RefreshOutcome::Skipped);
        };
        self.install().await
    }

    /// Caller must hold `turn`.
    async fn install(&self) -> Result<RefreshOutcome> {
        let proxy = self.source.acquire().await;
        let transport = self.factory.build(proxy.as_ref()).inspect_err(|e| {
            warn!("could not build transport for {:?}: {}", proxy, e);
        })?;

        let previous = {
            let mut state = self.state.write();
            state.proxy = proxy.clone();
            state.closed = false;
            state.transport.replace(transport)
        };
        // Pool of the old proxy goes away with the last in-flight user.
        drop(previous);

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(proxy = ?proxy.as_ref().map(|p| p.to_string()), "rotated proxy");
        Ok(RefreshOutcome::Rotated(proxy))
    }

    /// Release the transport and clear the active address. Waits for any
    /// in-flight refresh to finish first.
    pub async fn close(&self) {
        let _turn = self.turn.lock().await;
        let previous = {
            let mut state = self.state.write();
            state.proxy = None;
            state.closed = true;
            state.transport.take()
        };
        drop(previous);
        info!("rotator closed");
    }
}
