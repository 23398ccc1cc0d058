//! Collection methods.
//!
//! A [`Collector`] turns a [`CollectRequest`] into a [`RawPage`]. The engine
//! knows exactly three methods and walks them in a fixed fallback order:
//! browser automation, static fetch, official API.

pub mod api;
pub mod browser;
pub mod extract;
pub mod static_fetch;

pub use api::{ApiCollector, OfficialApi};
pub use browser::{BrowserCollector, BrowserLauncher, BrowserLease, BrowserPool, BrowserSession};
pub use extract::{FieldValue, ScrapedItem, extract_item};
pub use static_fetch::StaticFetcher;

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::ProxyEndpoint;
use crate::modules::spoofing::BrowserFingerprint;

/// Closed set of collection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMethod {
    Browser,
    StaticFetch,
    Api,
}

impl ScrapeMethod {
    /// Fallback order, most capable first.
    pub const FALLBACK_CHAIN: [ScrapeMethod; 3] =
        [ScrapeMethod::Browser, ScrapeMethod::StaticFetch, ScrapeMethod::Api];

    /// Method to try after this one fails; `None` at the end of the chain.
    pub fn next(self) -> Option<ScrapeMethod> {
        let position = Self::FALLBACK_CHAIN.iter().position(|m| *m == self)?;
        Self::FALLBACK_CHAIN.get(position + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScrapeMethod::Browser => "browser",
            ScrapeMethod::StaticFetch => "static_fetch",
            ScrapeMethod::Api => "api",
        }
    }
}

impl fmt::Display for ScrapeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeMethod {
    type Err = CollectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "browser" | "playwright" => Ok(ScrapeMethod::Browser),
            "static_fetch" | "static" | "cheerio" => Ok(ScrapeMethod::StaticFetch),
            "api" => Ok(ScrapeMethod::Api),
            other => Err(CollectError::UnknownMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("unknown scrape method `{0}`")]
    UnknownMethod(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),
    #[error("browser backend error: {0}")]
    Backend(String),
}

impl CollectError {
    /// Failed before any traffic left for the target, so no proxy was exercised.
    pub fn is_local(&self) -> bool {
        matches!(self, CollectError::UnknownMethod(_) | CollectError::Unavailable(_))
    }
}

/// Everything a collector needs for one attempt.
#[derive(Debug, Clone)]
pub struct CollectRequest {
    pub url: Url,
    pub source_type: String,
    pub proxy: Option<ProxyEndpoint>,
    pub stealth: bool,
    pub headless: bool,
    pub timeout: Duration,
    pub headers: HeaderMap,
    pub fingerprint: Option<BrowserFingerprint>,
}

impl CollectRequest {
    pub fn new(url: Url, source_type: impl Into<String>) -> Self {
        Self {
            url,
            source_type: source_type.into(),
            proxy: None,
            stealth: true,
            headless: true,
            timeout: Duration::from_secs(30),
            headers: HeaderMap::new(),
            fingerprint: None,
        }
    }
}

/// A fetched page, or an API payload.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub headers: HeaderMap,
    pub final_url: Url,
    pub body: String,
    /// Structured data returned by an official API instead of HTML.
    pub payload: Option<serde_json::Value>,
}

impl RawPage {
    pub fn html(status: u16, final_url: Url, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            final_url,
            body: body.into(),
            payload: None,
        }
    }

    pub fn json(final_url: Url, payload: serde_json::Value) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            final_url,
            body: String::new(),
            payload: Some(payload),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// 2xx and 3xx count as a usable response.
    pub fn is_success_status(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn method(&self) -> ScrapeMethod;
    async fn collect(&self, request: &CollectRequest) -> Result<RawPage, CollectError>;
}
