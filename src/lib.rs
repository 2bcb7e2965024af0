//! Resilient fetch client for scraping under anti-bot pressure.
//!
//! Failed or blocked requests are retried through a fresh proxy obtained
//! from a directory endpoint; bodies come back gunzipped and decoded with
//! the charset the page declares.

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod models;
pub mod proxy;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use engine::{BlockPageDetector, EngineBuilder, FetchEngine, ResponsePredicate};
pub use error::{DecodeError, FetchError, Result};
pub use models::{FetchRequest, ProxyAddress, ProxyBinding, RawResponse};
pub use proxy::{DirectoryProxySource, ProxyRotator, ProxySource, RefreshOutcome, RotatorStats};
pub use transport::{ByteStream, DirectClient, ReqwestTransportFactory, Transport, TransportFactory};
