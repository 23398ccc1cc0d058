//! # sentinelle-scraper
//!
//! Scraping orchestration for brand monitoring: a priority scheduler for
//! recurring sources, a scored proxy pool, per-domain rate limiting, blockage
//! detection and a unified engine that falls back across collection methods.
//!
//! The browser backend and persistence are supplied by the host through the
//! [`BrowserLauncher`] and [`OutcomeSink`] seams.
//!
//! ## Features
//!
//! - Browser automation, static fetch and official API collection with a
//!   fixed fallback chain
//! - Proxy reliability scoring with blacklist and cooldown
//! - Sliding-window rate limiting per domain
//! - Cloudflare, CAPTCHA, WAF and rate-limit detection with backoff
//! - Adaptive per-source scheduling with bounded retries
//!
//! ## Example
//!
//! ```no_run
//! use sentinelle_scraper::{ScrapeMethod, ScrapeRequest, UnifiedScrapingEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Without a browser launcher, start from the static fetcher.
//!     let engine = UnifiedScrapingEngine::builder()
//!         .with_primary_method(ScrapeMethod::StaticFetch)
//!         .build()?;
//!     engine.start().await?;
//!     let outcome = engine
//!         .scrape(ScrapeRequest::new("https://example.com").with_selector("title", "h1"))
//!         .await;
//!     println!("success: {} via {}", outcome.success, outcome.method_used);
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod engine;

pub mod collectors;
pub mod config;
pub mod external_deps;
pub mod modules;

pub use crate::engine::{
    EngineBuilder,
    EngineConfig,
    EngineError,
    EngineResult,
    HealthReport,
    OutcomeSink,
    PendingSources,
    ScrapeOutcome,
    ScrapeRequest,
    SourceRegistered,
    UnifiedScrapingEngine,
};

pub use crate::collectors::{
    ApiCollector,
    BrowserCollector,
    BrowserLauncher,
    BrowserLease,
    BrowserPool,
    BrowserSession,
    CollectError,
    CollectRequest,
    Collector,
    FieldValue,
    OfficialApi,
    RawPage,
    ScrapeMethod,
    ScrapedItem,
    StaticFetcher,
    extract_item,
};

pub use crate::config::{CaptchaSettings, ConfigError, ProxySettings, ScraperSettings};

pub use crate::external_deps::captcha::{
    CaptchaConfig,
    CaptchaError,
    CaptchaJobId,
    CaptchaKind,
    CaptchaPoll,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
    TwoCaptchaProvider,
};

pub use crate::modules::{
    AntiDetectionConfig,
    AntiDetectionSystem,
    BackoffPolicy,
    BlockageRetryError,
    BlockageType,
    BrowserFingerprint,
    ConsistencyLevel,
    DetectionResult,
    DomainLimit,
    DomainStats,
    EventDispatcher,
    EventHandler,
    FingerprintGenerator,
    GlobalStats,
    JobExecutor,
    JobReport,
    JobSnapshot,
    JobStatus,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    ObservedResponse,
    Priority,
    ProxyConfig,
    ProxyEndpoint,
    ProxyHealthCheck,
    ProxyHealthReport,
    ProxyManager,
    ProxyPoolStats,
    ProxyProbe,
    ProxyProvider,
    RateLimitConfig,
    RateLimitStats,
    RateLimiter,
    RetryPolicy,
    SchedulerConfig,
    SchedulerError,
    SchedulerStats,
    ScraperEvent,
    ScrapingJob,
    SmartScheduler,
    SourceRegistration,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
