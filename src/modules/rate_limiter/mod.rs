//! Per-domain sliding window rate limiting.
//!
//! Every domain owns a window of recent acquisition timestamps. Callers over
//! quota are suspended until the oldest timestamp leaves the window; the lock
//! guarding the windows is never held across that suspension, so one busy
//! domain never stalls another.

use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Quota for a single domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimit {
    pub requests: usize,
    pub window: Duration,
}

impl DomainLimit {
    pub fn new(requests: usize, window: Duration) -> Self {
        Self {
            requests: requests.max(1),
            window,
        }
    }

    pub fn per_minute(requests: usize) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub default_limit: DomainLimit,
    pub overrides: HashMap<String, DomainLimit>,
    pub max_jitter: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let overrides = [
            ("trustpilot.com", DomainLimit::per_minute(5)),
            ("google.com", DomainLimit::per_minute(3)),
            ("twitter.com", DomainLimit::per_minute(15)),
        ]
        .into_iter()
        .map(|(domain, limit)| (domain.to_string(), limit))
        .collect();

        Self {
            default_limit: DomainLimit::per_minute(10),
            overrides,
            max_jitter: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub domain: String,
    pub requests_made: usize,
    pub limit: usize,
    pub window_secs: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<String, VecDeque<Instant>>,
}

/// Sliding window limiter keyed by target domain.
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: DomainLimit,
    max_jitter: Duration,
    limits: Mutex<HashMap<String, DomainLimit>>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_jitter: config.max_jitter,
            limits: Mutex::new(config.overrides),
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Reconfigures the quota for `domain`.
    pub fn set_limit(&self, domain: &str, requests: usize, window: Duration) {
        self.limits
            .lock()
            .expect("rate limit table poisoned")
            .insert(normalize(domain), DomainLimit::new(requests, window));
    }

    /// Quota applying to `domain`; subdomains inherit a parent's override.
    pub fn limit_for(&self, domain: &str) -> DomainLimit {
        let limits = self.limits.lock().expect("rate limit table poisoned");
        let domain = normalize(domain);
        let mut candidate = domain.as_str();
        loop {
            if let Some(limit) = limits.get(candidate) {
                return *limit;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return self.default_limit,
            }
        }
    }

    /// Waits until a request to `domain` fits its quota and records it.
    ///
    /// Returns the total time spent suspended; zero when admitted immediately.
    pub async fn acquire(&self, domain: &str) -> Duration {
        let key = normalize(domain);
        let limit = self.limit_for(&key);
        let mut waited = Duration::ZERO;

        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter state poisoned");
                let now = Instant::now();
                let window = state.windows.entry(key.clone()).or_default();
                prune(window, now, limit.window);

                if window.len() < limit.requests {
                    window.push_back(now);
                    None
                } else {
                    let oldest = window.front().copied().unwrap_or(now);
                    let remaining = limit.window.saturating_sub(now.saturating_duration_since(oldest));
                    Some(remaining + self.jitter())
                }
            };

            match wait {
                None => return waited,
                Some(delay) => {
                    log::debug!("rate limit reached for {}, waiting {:.2}s", key, delay.as_secs_f64());
                    sleep(delay).await;
                    waited += delay;
                }
            }
        }
    }

    pub fn stats(&self, domain: &str) -> RateLimitStats {
        let key = normalize(domain);
        let limit = self.limit_for(&key);
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let requests_made = match state.windows.get_mut(&key) {
            Some(window) => {
                prune(window, Instant::now(), limit.window);
                window.len()
            }
            None => 0,
        };

        RateLimitStats {
            domain: key,
            requests_made,
            limit: limit.requests,
            window_secs: limit.window.as_secs(),
        }
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max = self.max_jitter.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while matches!(window.front(), Some(ts) if now.saturating_duration_since(*ts) >= span) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter_without_jitter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_jitter: Duration::ZERO,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn subdomains_inherit_overrides() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.limit_for("www.trustpilot.com").requests, 5);
        assert_eq!(limiter.limit_for("Google.com").requests, 3);
        assert_eq!(limiter.limit_for("example.org").requests, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_immediately_under_quota() {
        let limiter = limiter_without_jitter();
        for _ in 0..10 {
            assert_eq!(limiter.acquire("example.org").await, Duration::ZERO);
        }
        let stats = limiter.stats("example.org");
        assert_eq!(stats.requests_made, 10);
        assert_eq!(stats.limit, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn suspends_until_oldest_leaves_window() {
        let limiter = limiter_without_jitter();
        limiter.set_limit("slow.test", 2, Duration::from_secs(30));
        limiter.acquire("slow.test").await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire("slow.test").await;

        let waited = limiter.acquire("slow.test").await;
        assert_eq!(waited, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_quota_in_any_window() {
        let limiter = Arc::new(RateLimiter::default());
        limiter.set_limit("busy.test", 3, Duration::from_secs(10));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("busy.test").await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|ts| ts.saturating_duration_since(*start) < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window starting at #{i} admitted {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn domains_do_not_block_each_other() {
        let limiter = Arc::new(limiter_without_jitter());
        limiter.set_limit("a.test", 1, Duration::from_secs(60));
        limiter.acquire("a.test").await;

        let blocked = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("a.test").await })
        };
        tokio::task::yield_now().await;

        assert_eq!(limiter.acquire("b.test").await, Duration::ZERO);
        assert!(!blocked.is_finished());
        assert_eq!(blocked.await.unwrap(), Duration::from_secs(60));
    }
}
