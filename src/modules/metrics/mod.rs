//! Metrics collection utilities.
//!
//! Aggregates scrape outcomes, latencies and blockage counts globally and
//! per domain. Snapshots are serializable and surface through the engine's
//! health report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::anti_detection::BlockageType;

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub blockages: u64,
    pub average_latency_secs: Option<f64>,
    pub p95_latency_secs: Option<f64>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            blockages: 0,
            average_latency_secs: None,
            p95_latency_secs: None,
        }
    }
}

/// Domain-scoped metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_secs: Option<f64>,
    pub p95_latency_secs: Option<f64>,
    pub consecutive_failures: u32,
    pub blockages: BTreeMap<String, u64>,
}

impl DomainStats {
    fn from_accumulator(domain: &str, acc: &DomainAccumulator) -> Self {
        let (avg, p95) = latency_stats(acc.latencies.iter().copied());
        Self {
            domain: domain.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            average_latency_secs: avg,
            p95_latency_secs: p95,
            consecutive_failures: acc.consecutive_failures,
            blockages: acc
                .blockages
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub domains: Vec<DomainStats>,
}

#[derive(Debug)]
struct DomainAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    blockages: HashMap<BlockageType, u64>,
}

impl DomainAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            blockages: HashMap::new(),
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_requests += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }
}

/// Mean and 95th percentile, in seconds.
fn latency_stats(samples: impl Iterator<Item = Duration>) -> (Option<f64>, Option<f64>) {
    let mut samples: Vec<_> = samples.collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(avg), Some(samples[p95_index].as_secs_f64()))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    domains: HashMap<String, DomainAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            domains: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, domain: &str) -> &mut DomainAccumulator {
        let max_window = self.max_window;
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainAccumulator::new(max_window))
    }
}

/// Thread-safe metrics collector shared by the engine and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_outcome(&self, domain: &str, success: bool, latency: Duration) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.total_requests += 1;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }

        let blended = match guard.global.average_latency_secs {
            Some(avg) => avg * 0.9 + latency.as_secs_f64() * 0.1,
            None => latency.as_secs_f64(),
        };
        guard.global.average_latency_secs = Some(blended);

        guard.accumulator_mut(domain).record(success, latency);

        let (_, p95) = latency_stats(
            guard
                .domains
                .values()
                .flat_map(|domain| domain.latencies.iter().copied()),
        );
        guard.global.p95_latency_secs = p95;
    }

    pub fn record_blockage(&self, domain: &str, blockage: BlockageType) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.blockages += 1;
        *guard
            .accumulator_mut(domain)
            .blockages
            .entry(blockage)
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut domains: Vec<_> = guard
            .domains
            .iter()
            .map(|(domain, acc)| DomainStats::from_accumulator(domain, acc))
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        MetricsSnapshot {
            global: guard.global.clone(),
            domains,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome("example.com", true, Duration::from_millis(150));
        metrics.record_outcome("example.com", false, Duration::from_millis(800));
        metrics.record_outcome("example.com", false, Duration::from_millis(400));

        let snapshot = metrics.snapshot();
        let domain = snapshot
            .domains
            .iter()
            .find(|d| d.domain == "example.com")
            .unwrap();
        assert_eq!(domain.total_requests, 3);
        assert_eq!(domain.successes, 1);
        assert_eq!(domain.failures, 2);
        assert_eq!(domain.consecutive_failures, 2);
        assert_eq!(domain.p95_latency_secs, Some(0.8));
    }

    #[test]
    fn blockages_are_tallied_per_type() {
        let metrics = MetricsCollector::new();
        metrics.record_blockage("a.test", BlockageType::RateLimit);
        metrics.record_blockage("a.test", BlockageType::RateLimit);
        metrics.record_blockage("b.test", BlockageType::Waf);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.blockages, 3);
        assert_eq!(snapshot.domains[0].blockages.get("rate_limit"), Some(&2));
        assert_eq!(snapshot.domains[1].blockages.get("waf"), Some(&1));
    }
}
