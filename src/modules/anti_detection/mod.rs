//! Blockage detection and evasion.
//!
//! [`AntiDetectionSystem`] classifies responses, retries blocked work with
//! exponential backoff, hands captchas to a solving service and produces the
//! browser identities and headers the collectors present to targets.

mod detection;

pub use detection::{BlockageType, DetectionResult, ObservedResponse, extract_site_key};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::CaptchaSettings;
use crate::external_deps::captcha::{self, CaptchaConfig, CaptchaKind, CaptchaProvider, CaptchaTask};
use crate::modules::spoofing::{self, BrowserFingerprint, ConsistencyLevel, FingerprintGenerator};

/// Exponential backoff applied while a target keeps blocking us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 3,
            max_jitter: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero based): `base * 2^attempt + jitter`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.base_delay.saturating_mul(factor);
        if self.max_jitter.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..self.max_jitter.as_secs_f64());
        base + Duration::from_secs_f64(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct AntiDetectionConfig {
    pub backoff: BackoffPolicy,
    pub captcha: CaptchaConfig,
    pub fingerprint_consistency: ConsistencyLevel,
}

impl Default for AntiDetectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            captcha: CaptchaConfig::default(),
            fingerprint_consistency: ConsistencyLevel::Domain,
        }
    }
}

/// Outcome of [`AntiDetectionSystem::handle_blockage`] when no attempt succeeded.
#[derive(Debug, Error)]
pub enum BlockageRetryError<E> {
    /// The response was not blocked and the single pass-through call failed.
    #[error("{0}")]
    Failed(E),
    #[error("still blocked ({blockage}) after {attempts} attempts")]
    Exhausted {
        blockage: BlockageType,
        attempts: u32,
        last_error: Option<E>,
    },
}

pub struct AntiDetectionSystem {
    config: AntiDetectionConfig,
    captcha: Option<Arc<dyn CaptchaProvider>>,
    fingerprints: Mutex<FingerprintGenerator>,
}

impl fmt::Debug for AntiDetectionSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AntiDetectionSystem")
            .field("config", &self.config)
            .field("captcha", &self.captcha.as_ref().map(|p| p.name()))
            .finish()
    }
}

impl AntiDetectionSystem {
    pub fn new(config: AntiDetectionConfig) -> Self {
        let fingerprints = FingerprintGenerator::new(config.fingerprint_consistency);
        Self {
            config,
            captcha: None,
            fingerprints: Mutex::new(fingerprints),
        }
    }

    /// Builds the system with the solving service described by `settings`.
    pub fn from_settings(settings: &CaptchaSettings) -> Self {
        let config = AntiDetectionConfig {
            captcha: CaptchaConfig::from(settings),
            ..AntiDetectionConfig::default()
        };
        let mut system = Self::new(config);
        system.captcha = captcha::provider_from_settings(settings);
        system
    }

    pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.captcha = Some(provider);
        self
    }

    pub fn config(&self) -> &AntiDetectionConfig {
        &self.config
    }

    pub fn has_captcha_provider(&self) -> bool {
        self.captcha.is_some()
    }

    /// Classifies a response; the same inputs always give the same result.
    pub fn detect_blockage(&self, response: &ObservedResponse<'_>, html: &str) -> DetectionResult {
        detection::classify(response, html)
    }

    /// Re-runs `retry` with exponential backoff while `detection` reports a block.
    ///
    /// An unblocked detection runs `retry` once without delay. A blocked one
    /// sleeps `base * 2^attempt + jitter` before each of at most
    /// `max_attempts` calls and returns the first success.
    pub async fn handle_blockage<T, E, F, Fut>(
        &self,
        detection: &DetectionResult,
        mut retry: F,
    ) -> Result<T, BlockageRetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !detection.is_blocked {
            return retry().await.map_err(BlockageRetryError::Failed);
        }

        log::warn!("blockage detected: {}", detection.message);
        if !detection.solutions.is_empty() {
            log::info!("suggested remediation: {}", detection.solutions.join(", "));
        }

        let policy = self.config.backoff;
        let mut last_error = None;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            log::info!(
                "retry {}/{} in {:.1}s",
                attempt + 1,
                policy.max_attempts,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;

            match retry().await {
                Ok(value) => {
                    log::info!("retry {} succeeded", attempt + 1);
                    return Ok(value);
                }
                Err(err) => {
                    log::warn!("retry {} failed: {}", attempt + 1, err);
                    last_error = Some(err);
                }
            }
        }

        Err(BlockageRetryError::Exhausted {
            blockage: detection.blockage_type,
            attempts: policy.max_attempts,
            last_error,
        })
    }

    /// Solves a reCAPTCHA v2 widget. `None` on any failure or timeout.
    pub async fn solve_captcha(&self, site_key: &str, page_url: &str) -> Option<String> {
        self.solve_captcha_kind(CaptchaKind::ReCaptchaV2, site_key, page_url)
            .await
    }

    pub async fn solve_captcha_kind(
        &self,
        kind: CaptchaKind,
        site_key: &str,
        page_url: &str,
    ) -> Option<String> {
        let Some(provider) = self.captcha.as_ref() else {
            log::warn!("captcha solving requested without a configured provider");
            return None;
        };

        let url = match Url::parse(page_url) {
            Ok(url) => url,
            Err(err) => {
                log::error!("captcha page url {} is invalid: {}", page_url, err);
                return None;
            }
        };

        let task = CaptchaTask::new(site_key, url).with_kind(kind);
        match captcha::solve(provider.as_ref(), &task, &self.config.captcha).await {
            Ok(solution) => {
                log::info!("captcha solved by {}", provider.name());
                Some(solution.token)
            }
            Err(err) => {
                log::error!("captcha solving failed: {}", err);
                None
            }
        }
    }

    /// A fresh random identity.
    pub fn generate_fingerprint(&self) -> BrowserFingerprint {
        spoofing::random_fingerprint()
    }

    /// Identity for `domain` under the configured consistency level.
    pub fn fingerprint_for(&self, domain: &str) -> BrowserFingerprint {
        self.fingerprints
            .lock()
            .expect("fingerprint cache poisoned")
            .generate_for(domain)
    }

    pub fn invalidate_fingerprint(&self, domain: &str) {
        self.fingerprints
            .lock()
            .expect("fingerprint cache poisoned")
            .invalidate(domain);
    }

    /// Navigation headers a real browser with `fingerprint` would send.
    pub fn stealth_headers(&self, fingerprint: &BrowserFingerprint) -> HeaderMap {
        static STATIC_HEADERS: &[(&str, &str)] = &[
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
            ("accept-encoding", "gzip, deflate, br"),
            ("upgrade-insecure-requests", "1"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "none"),
            ("sec-fetch-user", "?1"),
            ("cache-control", "max-age=0"),
        ];

        let mut headers = HeaderMap::new();
        for (name, value) in STATIC_HEADERS {
            headers.insert(HeaderName::from_static(*name), HeaderValue::from_static(*value));
        }
        if let Ok(value) = HeaderValue::from_str(&fingerprint.user_agent) {
            headers.insert(http::header::USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&fingerprint.language) {
            headers.insert(http::header::ACCEPT_LANGUAGE, value);
        }
        headers
    }

    /// Stable hex digest identifying a request, used for deduplication.
    pub fn request_hash(&self, url: &str, method: &Method) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(url.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Default for AntiDetectionSystem {
    fn default() -> Self {
        Self::new(AntiDetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::captcha::{CaptchaError, CaptchaJobId, CaptchaPoll, CaptchaSolution};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn system_without_jitter() -> AntiDetectionSystem {
        AntiDetectionSystem::new(AntiDetectionConfig {
            backoff: BackoffPolicy {
                max_jitter: Duration::ZERO,
                ..BackoffPolicy::default()
            },
            ..AntiDetectionConfig::default()
        })
    }

    #[test]
    fn backoff_doubles() {
        let policy = BackoffPolicy {
            max_jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));

        let jittered = BackoffPolicy::default().delay_for(1);
        assert!(jittered >= Duration::from_secs(10) && jittered < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn unblocked_runs_once_without_delay() {
        let system = system_without_jitter();
        let started = Instant::now();
        let value: Result<u8, BlockageRetryError<String>> = system
            .handle_blockage(&DetectionResult::clear(), || async { Ok(7) })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_until_success() {
        let system = system_without_jitter();
        let calls = AtomicU32::new(0);
        let detection = DetectionResult::blocked(BlockageType::RateLimit, "rate limited (429)");
        let started = Instant::now();

        let result = system
            .handle_blockage(&detection, || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err(format!("blocked #{n}")) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(5 + 10 + 20));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let system = system_without_jitter();
        let calls = AtomicU32::new(0);
        let detection = DetectionResult::blocked(BlockageType::Waf, "WAF blocked (403)");

        let result: Result<(), _> = system
            .handle_blockage(&detection, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still 403") }
            })
            .await;

        match result {
            Err(BlockageRetryError::Exhausted {
                blockage,
                attempts,
                last_error,
            }) => {
                assert_eq!(blockage, BlockageType::Waf);
                assert_eq!(attempts, 3);
                assert_eq!(last_error, Some("still 403"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct NeverReady;

    #[async_trait]
    impl CaptchaProvider for NeverReady {
        fn name(&self) -> &'static str {
            "never-ready"
        }

        async fn submit(&self, _task: &CaptchaTask) -> Result<CaptchaJobId, CaptchaError> {
            Ok(CaptchaJobId("1".into()))
        }

        async fn poll(&self, _job: &CaptchaJobId) -> Result<CaptchaPoll, CaptchaError> {
            Ok(CaptchaPoll::Pending)
        }
    }

    struct Instant42;

    #[async_trait]
    impl CaptchaProvider for Instant42 {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn submit(&self, _task: &CaptchaTask) -> Result<CaptchaJobId, CaptchaError> {
            Ok(CaptchaJobId("42".into()))
        }

        async fn poll(&self, job: &CaptchaJobId) -> Result<CaptchaPoll, CaptchaError> {
            Ok(CaptchaPoll::Ready(CaptchaSolution::new(format!("token-{}", job.0))))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_times_out_within_deadline() {
        let system = AntiDetectionSystem::default().with_captcha_provider(Arc::new(NeverReady));
        let started = Instant::now();
        let token = system.solve_captcha("key", "https://example.com/").await;
        assert!(token.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_returns_token() {
        let system = AntiDetectionSystem::default().with_captcha_provider(Arc::new(Instant42));
        let token = system.solve_captcha("key", "https://example.com/").await;
        assert_eq!(token.as_deref(), Some("token-42"));
    }

    #[tokio::test]
    async fn captcha_without_provider_is_none() {
        let system = AntiDetectionSystem::default();
        assert!(system.solve_captcha("key", "https://example.com/").await.is_none());
    }

    #[test]
    fn request_hash_is_stable_and_method_sensitive() {
        let system = AntiDetectionSystem::default();
        let get = system.request_hash("https://example.com/a", &Method::GET);
        assert_eq!(get, system.request_hash("https://example.com/a", &Method::GET));
        assert_ne!(get, system.request_hash("https://example.com/a", &Method::POST));
        assert_eq!(get.len(), 64);
    }

    #[test]
    fn stealth_headers_follow_fingerprint() {
        let system = AntiDetectionSystem::default();
        let fingerprint = system.fingerprint_for("example.com");
        let headers = system.stealth_headers(&fingerprint);
        assert_eq!(
            headers.get(http::header::USER_AGENT).unwrap(),
            fingerprint.user_agent.as_str()
        );
        assert_eq!(
            headers.get(http::header::ACCEPT_LANGUAGE).unwrap(),
            fingerprint.language.as_str()
        );
        assert_eq!(headers.get("sec-fetch-mode").unwrap(), "navigate");
    }
}
