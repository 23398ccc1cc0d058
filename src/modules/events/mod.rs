//! Event system for the scraping engine.
//!
//! Provides hooks for metrics, logging, and custom reactions around every
//! collection attempt.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::anti_detection::BlockageType;
use super::metrics::MetricsCollector;
use crate::collectors::ScrapeMethod;

/// A collection attempt is about to start.
#[derive(Debug, Clone)]
pub struct ScrapeAttemptEvent {
    pub url: String,
    pub domain: String,
    pub method: ScrapeMethod,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Final outcome of a scrape request, after fallbacks.
#[derive(Debug, Clone)]
pub struct ScrapeCompletedEvent {
    pub url: String,
    pub domain: String,
    pub method: ScrapeMethod,
    pub success: bool,
    pub attempts: u32,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockageEvent {
    pub url: String,
    pub domain: String,
    pub blockage_type: BlockageType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub domain: String,
    pub attempt: u32,
    pub reason: String,
    pub next_method: ScrapeMethod,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotatedEvent {
    pub domain: String,
    pub previous: Option<String>,
    pub next: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ScraperEvent {
    ScrapeAttempt(ScrapeAttemptEvent),
    ScrapeCompleted(ScrapeCompletedEvent),
    Blockage(BlockageEvent),
    Retry(RetryEvent),
    ProxyRotated(ProxyRotatedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ScraperEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: ScraperEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ScraperEvent) {
        match event {
            ScraperEvent::ScrapeAttempt(attempt) => {
                log::debug!(
                    "-> {} via {} (attempt {}, proxy {})",
                    attempt.url,
                    attempt.method,
                    attempt.attempt,
                    attempt.proxy.as_deref().unwrap_or("none")
                );
            }
            ScraperEvent::ScrapeCompleted(done) => {
                if done.success {
                    log::info!(
                        "<- {} via {} in {:.2}s",
                        done.url,
                        done.method,
                        done.latency.as_secs_f64()
                    );
                } else {
                    log::warn!(
                        "<- {} failed after {} attempts: {}",
                        done.url,
                        done.attempts,
                        done.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            ScraperEvent::Blockage(blockage) => {
                log::warn!("blockage {} on {}: {}", blockage.blockage_type, blockage.domain, blockage.message);
            }
            ScraperEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} with {} ({})",
                    retry.domain,
                    retry.attempt,
                    retry.next_method,
                    retry.reason
                );
            }
            ScraperEvent::ProxyRotated(rotated) => {
                log::debug!(
                    "proxy rotated for {}: {} -> {}",
                    rotated.domain,
                    rotated.previous.as_deref().unwrap_or("none"),
                    rotated.next.as_deref().unwrap_or("none")
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ScraperEvent) {
        match event {
            ScraperEvent::ScrapeCompleted(done) => {
                self.metrics
                    .record_outcome(&done.domain, done.success, done.latency);
            }
            ScraperEvent::Blockage(blockage) => {
                self.metrics
                    .record_blockage(&blockage.domain, blockage.blockage_type);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &ScraperEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn blockage(domain: &str) -> ScraperEvent {
        ScraperEvent::Blockage(BlockageEvent {
            url: format!("https://{domain}/"),
            domain: domain.into(),
            blockage_type: BlockageType::Cloudflare,
            message: "detected cloudflare".into(),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(blockage("example.com"));
        assert_eq!(*counter.0.lock().unwrap(), 1);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn metrics_handler_counts_blockages() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&blockage("example.com"));
        handler.handle(&ScraperEvent::ScrapeCompleted(ScrapeCompletedEvent {
            url: "https://example.com/".into(),
            domain: "example.com".into(),
            method: ScrapeMethod::StaticFetch,
            success: true,
            attempts: 2,
            latency: Duration::from_millis(300),
            error: None,
            timestamp: Utc::now(),
        }));

        let snapshot = metrics.snapshot();
        let domain = &snapshot.domains[0];
        assert_eq!(domain.blockages.get("cloudflare"), Some(&1));
        assert_eq!(domain.successes, 1);
    }
}
