//! Orchestration services module
//!
//! Proxy pool, rate limiting, blockage handling, browser identities,
//! scheduling, events and metrics used by the engine.

pub mod anti_detection;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod rate_limiter;
pub mod scheduler;
pub mod spoofing;

// Re-export commonly used types
pub use anti_detection::{
    AntiDetectionConfig,
    AntiDetectionSystem,
    BackoffPolicy,
    BlockageRetryError,
    BlockageType,
    DetectionResult,
    ObservedResponse,
};
pub use events::{
    BlockageEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler,
    ProxyRotatedEvent, RetryEvent, ScrapeAttemptEvent, ScrapeCompletedEvent, ScraperEvent,
};
pub use metrics::{DomainStats, GlobalStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{
    ProxyConfig, ProxyEndpoint, ProxyHealthCheck, ProxyHealthReport, ProxyManager,
    ProxyPoolStats, ProxyProbe, ProxyProvider, ReqwestProxyProbe,
};
pub use rate_limiter::{DomainLimit, RateLimitConfig, RateLimitStats, RateLimiter};
pub use scheduler::{
    JobExecutor, JobReport, JobSnapshot, JobStatus, Priority, RetryPolicy, SchedulerConfig,
    SchedulerError, SchedulerStats, ScrapingJob, SmartScheduler, SourceRegistration, TickSummary,
};
pub use spoofing::{BrowserFingerprint, ConsistencyLevel, FingerprintGenerator, ScreenProfile};
