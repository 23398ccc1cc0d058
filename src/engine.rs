//! High level scraping orchestration.
//!
//! Wires the proxy pool, rate limiter, anti-detection system, collectors and
//! scheduler together. One [`UnifiedScrapingEngine::scrape`] call waits for
//! its domain quota, picks a proxy, then walks the collection fallback chain
//! until a method yields an unblocked page or the retry budget runs out.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::collectors::{
	ApiCollector, BrowserCollector, BrowserLauncher, BrowserPool, CollectError, CollectRequest,
	Collector, OfficialApi, ScrapeMethod, ScrapedItem, StaticFetcher, extract_item,
};
use crate::config::{ConfigError, ScraperSettings};
use crate::external_deps::captcha::{self, CaptchaConfig, CaptchaProvider};
use crate::modules::anti_detection::{
	AntiDetectionConfig, AntiDetectionSystem, DetectionResult, ObservedResponse,
};
use crate::modules::events::{
	BlockageEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler,
	ProxyRotatedEvent, RetryEvent, ScrapeAttemptEvent, ScrapeCompletedEvent, ScraperEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::proxy::{
	ProxyConfig, ProxyEndpoint, ProxyHealthCheck, ProxyManager, ProxyPoolStats, ProxyProbe,
	ReqwestProxyProbe,
};
use crate::modules::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::modules::scheduler::{
	JobExecutor, JobReport, JobSnapshot, Priority, SchedulerConfig, SchedulerError,
	SchedulerStats, ScrapingJob, SmartScheduler, SourceRegistration,
};

/// Result alias used across the orchestration layer.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine construction and source management.
///
/// Scrapes themselves never fail with this type; see [`ScrapeOutcome`].
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("invalid engine configuration: {0}")]
	InvalidConfig(String),
	#[error("scheduler error: {0}")]
	Scheduler(#[from] SchedulerError),
	#[error("invalid url `{url}`: {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},
	#[error("browser pool failed to start: {0}")]
	BrowserPool(#[source] CollectError),
	#[error("engine is shut down")]
	ShutDown,
}

/// Engine configuration used by the builder.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub primary_method: ScrapeMethod,
	/// Total collection attempts per scrape, fallbacks included.
	pub max_retries: u32,
	pub browser_pool_size: usize,
	pub headless: bool,
	pub request_timeout: Duration,
	pub enable_metrics: bool,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			primary_method: ScrapeMethod::Browser,
			max_retries: 3,
			browser_pool_size: 3,
			headless: true,
			request_timeout: Duration::from_secs(30),
			enable_metrics: true,
		}
	}
}

/// One-off scrape request.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
	pub url: String,
	pub selectors: BTreeMap<String, String>,
	/// Overrides the engine's primary method for this request.
	pub method: Option<ScrapeMethod>,
	pub use_proxy: bool,
	pub stealth: bool,
	pub headless: bool,
	pub country: Option<String>,
	pub timeout: Option<Duration>,
	pub source_type: String,
}

impl ScrapeRequest {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			selectors: BTreeMap::new(),
			method: None,
			use_proxy: true,
			stealth: true,
			headless: true,
			country: None,
			timeout: None,
			source_type: "generic".into(),
		}
	}

	pub fn with_selector(mut self, name: impl Into<String>, selector: impl Into<String>) -> Self {
		self.selectors.insert(name.into(), selector.into());
		self
	}

	pub fn with_selectors(mut self, selectors: BTreeMap<String, String>) -> Self {
		self.selectors = selectors;
		self
	}

	pub fn with_method(mut self, method: ScrapeMethod) -> Self {
		self.method = Some(method);
		self
	}

	pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
		self.source_type = source_type.into();
		self
	}

	pub fn with_country(mut self, country: impl Into<String>) -> Self {
		self.country = Some(country.into());
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn without_proxy(mut self) -> Self {
		self.use_proxy = false;
		self
	}

	pub fn without_stealth(mut self) -> Self {
		self.stealth = false;
		self
	}

	pub fn headful(mut self) -> Self {
		self.headless = false;
		self
	}
}

impl From<&SourceRegistration> for ScrapeRequest {
	fn from(source: &SourceRegistration) -> Self {
		Self {
			selectors: source.selectors.clone(),
			country: source.country.clone(),
			source_type: source.source_type.clone(),
			..Self::new(source.url.clone())
		}
	}
}

/// Result of a scrape, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeOutcome {
	pub success: bool,
	pub url: String,
	pub method_used: ScrapeMethod,
	pub proxy_used: Option<String>,
	pub data: Option<ScrapedItem>,
	pub error: Option<String>,
	/// Last classification evaluated, blocked or not.
	#[serde(rename = "blockage_detected")]
	pub blockage: Option<DetectionResult>,
	pub attempts: u32,
	#[serde(serialize_with = "as_secs_f64")]
	pub execution_time: Duration,
}

impl ScrapeOutcome {
	fn rejected(url: &str, method: ScrapeMethod, error: String, started: Instant) -> Self {
		Self {
			success: false,
			url: url.to_string(),
			method_used: method,
			proxy_used: None,
			data: None,
			error: Some(error),
			blockage: None,
			attempts: 0,
			execution_time: started.elapsed(),
		}
	}

	pub fn is_blocked(&self) -> bool {
		self.blockage.as_ref().is_some_and(|d| d.is_blocked)
	}
}

fn as_secs_f64<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_f64(duration.as_secs_f64())
}

/// Echo of a registered source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRegistered {
	pub source_id: String,
	pub priority: Priority,
	pub frequency_secs: u64,
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSources {
	pub jobs: Vec<JobSnapshot>,
	pub stats: SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
	pub proxies: ProxyPoolStats,
	pub browser_pool_size: usize,
	pub browser_pool_available: usize,
	pub scheduler: SchedulerStats,
	pub scheduler_running: bool,
	pub captcha_solver: bool,
	pub metrics: Option<MetricsSnapshot>,
}

/// Receives the outcome of every scheduled scrape, typically to persist it.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
	async fn store(&self, source: &SourceRegistration, outcome: &ScrapeOutcome);
}

/// Fluent builder for [`UnifiedScrapingEngine`].
pub struct EngineBuilder {
	config: EngineConfig,
	settings: Option<ScraperSettings>,
	proxy_config: ProxyConfig,
	proxies: Vec<ProxyEndpoint>,
	probe: Option<Arc<dyn ProxyProbe>>,
	anti_detection: AntiDetectionConfig,
	captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	rate_limits: RateLimitConfig,
	scheduler: SchedulerConfig,
	collectors: Vec<Arc<dyn Collector>>,
	launcher: Option<Arc<dyn BrowserLauncher>>,
	apis: Vec<Arc<dyn OfficialApi>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	sink: Option<Arc<dyn OutcomeSink>>,
}

impl EngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			settings: None,
			proxy_config: ProxyConfig::default(),
			proxies: Vec::new(),
			probe: None,
			anti_detection: AntiDetectionConfig::default(),
			captcha_provider: None,
			rate_limits: RateLimitConfig::default(),
			scheduler: SchedulerConfig::default(),
			collectors: Vec::new(),
			launcher: None,
			apis: Vec::new(),
			handlers: Vec::new(),
			sink: None,
		}
	}

	/// Builder seeded from the process environment.
	pub fn from_env() -> EngineResult<Self> {
		Ok(Self::new().with_settings(ScraperSettings::from_env()?))
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_settings(mut self, settings: ScraperSettings) -> Self {
		self.settings = Some(settings);
		self
	}

	pub fn with_primary_method(mut self, method: ScrapeMethod) -> Self {
		self.config.primary_method = method;
		self
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.config.max_retries = retries;
		self
	}

	pub fn with_browser_pool_size(mut self, size: usize) -> Self {
		self.config.browser_pool_size = size;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = ProxyEndpoint>,
	{
		self.proxies.extend(proxies);
		self
	}

	pub fn with_proxy_config(mut self, config: ProxyConfig) -> Self {
		self.proxy_config = config;
		self
	}

	pub fn with_proxy_probe(mut self, probe: Arc<dyn ProxyProbe>) -> Self {
		self.probe = Some(probe);
		self
	}

	pub fn with_anti_detection_config(mut self, config: AntiDetectionConfig) -> Self {
		self.anti_detection = config;
		self
	}

	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha_provider = Some(provider);
		self
	}

	pub fn with_rate_limits(mut self, config: RateLimitConfig) -> Self {
		self.rate_limits = config;
		self
	}

	pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
		self.scheduler = config;
		self
	}

	/// Replaces the built-in collector for `collector.method()`.
	pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
		self.collectors.push(collector);
		self
	}

	pub fn with_browser_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
		self.launcher = Some(launcher);
		self
	}

	pub fn with_official_api(mut self, api: Arc<dyn OfficialApi>) -> Self {
		self.apis.push(api);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_outcome_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	pub fn build(self) -> EngineResult<UnifiedScrapingEngine> {
		UnifiedScrapingEngine::from_builder(self)
	}
}

impl Default for EngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Top level orchestrator, owned by the hosting process.
pub struct UnifiedScrapingEngine {
	config: EngineConfig,
	proxies: ProxyManager,
	probe: Arc<dyn ProxyProbe>,
	rate_limiter: RateLimiter,
	anti_detection: AntiDetectionSystem,
	scheduler: SmartScheduler,
	collectors: HashMap<ScrapeMethod, Arc<dyn Collector>>,
	browser: Arc<BrowserCollector>,
	launcher: Option<Arc<dyn BrowserLauncher>>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
	sink: Option<Arc<dyn OutcomeSink>>,
	shut_down: AtomicBool,
}

impl std::fmt::Debug for UnifiedScrapingEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UnifiedScrapingEngine")
			.field("config", &self.config)
			.field("proxies", &self.proxies.len())
			.field("browser_pool", &self.browser.pool())
			.field("shut_down", &self.shut_down.load(Ordering::SeqCst))
			.finish()
	}
}

struct Attempt {
	item: ScrapedItem,
	detection: DetectionResult,
}

struct AttemptFailure {
	error: String,
	detection: Option<DetectionResult>,
	/// Whether traffic reached the target, and with it the proxy.
	reached_target: bool,
}

impl AttemptFailure {
	/// Setup gap on our side: nothing was sent.
	fn local(error: impl Into<String>) -> Self {
		Self {
			error: error.into(),
			detection: None,
			reached_target: false,
		}
	}

	fn remote(error: impl Into<String>, detection: Option<DetectionResult>) -> Self {
		Self {
			error: error.into(),
			detection,
			reached_target: true,
		}
	}
}

impl From<CollectError> for AttemptFailure {
	fn from(err: CollectError) -> Self {
		if err.is_local() {
			Self::local(err.to_string())
		} else {
			Self::remote(err.to_string(), None)
		}
	}
}

impl UnifiedScrapingEngine {
	/// Engine with default configuration and no proxies.
	pub fn new() -> EngineResult<Self> {
		Self::builder().build()
	}

	pub fn builder() -> EngineBuilder {
		EngineBuilder::new()
	}

	fn from_builder(builder: EngineBuilder) -> EngineResult<Self> {
		let EngineBuilder {
			mut config,
			settings,
			proxy_config,
			proxies: extra_proxies,
			probe,
			anti_detection: anti_detection_config,
			captcha_provider,
			rate_limits,
			scheduler,
			collectors: overrides,
			launcher,
			apis,
			handlers,
			sink,
		} = builder;

		if launcher.is_some() && config.browser_pool_size == 0 {
			return Err(EngineError::InvalidConfig(
				"browser pool size must be at least 1".into(),
			));
		}
		config.max_retries = config.max_retries.max(1);

		let proxies = match &settings {
			Some(settings) => ProxyManager::from_settings(&settings.proxy),
			None => ProxyManager::new(proxy_config),
		};
		proxies.load(extra_proxies);

		let probe: Arc<dyn ProxyProbe> = match probe {
			Some(probe) => probe,
			None => Arc::new(ReqwestProxyProbe::new(
				proxies.config().test_url.clone(),
				proxies.config().probe_timeout,
			)),
		};

		let mut anti_detection = match &settings {
			Some(settings) => {
				let mut system = AntiDetectionSystem::new(AntiDetectionConfig {
					captcha: CaptchaConfig::from(&settings.captcha),
					..anti_detection_config
				});
				if let Some(provider) = captcha::provider_from_settings(&settings.captcha) {
					system = system.with_captcha_provider(provider);
				}
				system
			}
			None => AntiDetectionSystem::new(anti_detection_config),
		};
		if let Some(provider) = captcha_provider {
			anti_detection = anti_detection.with_captcha_provider(provider);
		}

		let browser = Arc::new(BrowserCollector::new());
		let mut api = ApiCollector::new();
		for official in apis {
			api.register(official);
		}

		let mut collectors: HashMap<ScrapeMethod, Arc<dyn Collector>> = HashMap::new();
		collectors.insert(ScrapeMethod::Browser, browser.clone());
		collectors.insert(ScrapeMethod::StaticFetch, Arc::new(StaticFetcher::new()));
		collectors.insert(ScrapeMethod::Api, Arc::new(api));
		for collector in overrides {
			collectors.insert(collector.method(), collector);
		}

		let metrics = config.enable_metrics.then(MetricsCollector::new);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}

		log::info!(
			"scraping engine ready (primary {}, {} proxies, captcha solver: {})",
			config.primary_method,
			proxies.len(),
			anti_detection.has_captcha_provider()
		);

		Ok(Self {
			config,
			proxies,
			probe,
			rate_limiter: RateLimiter::new(rate_limits),
			anti_detection,
			scheduler: SmartScheduler::new(scheduler),
			collectors,
			browser,
			launcher,
			metrics,
			events: Arc::new(events),
			sink,
			shut_down: AtomicBool::new(false),
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn proxies(&self) -> &ProxyManager {
		&self.proxies
	}

	pub fn rate_limiter(&self) -> &RateLimiter {
		&self.rate_limiter
	}

	pub fn anti_detection(&self) -> &AntiDetectionSystem {
		&self.anti_detection
	}

	pub fn scheduler(&self) -> &SmartScheduler {
		&self.scheduler
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	pub fn is_shut_down(&self) -> bool {
		self.shut_down.load(Ordering::SeqCst)
	}

	/// Launches the browser pool. A no-op without a launcher or once started.
	pub async fn start(&self) -> EngineResult<()> {
		if self.is_shut_down() {
			return Err(EngineError::ShutDown);
		}
		let Some(launcher) = &self.launcher else {
			log::info!("no browser launcher configured, browser method disabled");
			return Ok(());
		};
		if self.browser.pool().is_some() {
			return Ok(());
		}

		let pool = BrowserPool::launch(
			launcher.as_ref(),
			self.config.browser_pool_size,
			self.config.headless,
		)
		.await
		.map_err(EngineError::BrowserPool)?;
		self.browser.install(Arc::new(pool));
		Ok(())
	}

	/// Scrapes one URL, falling back across methods on failure.
	///
	/// Never fails: errors, blockages and exhausted retries are reported in
	/// the returned outcome.
	pub async fn scrape(&self, request: ScrapeRequest) -> ScrapeOutcome {
		let started = Instant::now();
		let mut method = request.method.unwrap_or(self.config.primary_method);

		if self.is_shut_down() {
			return ScrapeOutcome::rejected(&request.url, method, EngineError::ShutDown.to_string(), started);
		}
		let url = match Url::parse(&request.url) {
			Ok(url) => url,
			Err(err) => {
				return ScrapeOutcome::rejected(
					&request.url,
					method,
					format!("invalid url: {}", err),
					started,
				);
			}
		};
		let domain = url.host_str().unwrap_or_default().to_ascii_lowercase();
		log::debug!(
			"scrape {} (request {})",
			url,
			&self.anti_detection.request_hash(url.as_str(), &Method::GET)[..12]
		);

		let waited = self.rate_limiter.acquire(&domain).await;
		if !waited.is_zero() {
			log::debug!("{} admitted after {:.2}s", domain, waited.as_secs_f64());
		}

		let mut proxy = if request.use_proxy {
			self.proxies.select_proxy(request.country.as_deref())
		} else {
			None
		};

		let max_attempts = self.config.max_retries;
		let mut attempts = 0u32;
		let mut last_detection = None;
		let result = loop {
			attempts += 1;
			self.events.dispatch(ScraperEvent::ScrapeAttempt(ScrapeAttemptEvent {
				url: url.to_string(),
				domain: domain.clone(),
				method,
				attempt: attempts,
				proxy: proxy.as_ref().map(ProxyEndpoint::redacted_url),
				timestamp: chrono::Utc::now(),
			}));

			match self.attempt(&request, &url, &domain, method, proxy.as_ref()).await {
				Ok(attempt) => {
					last_detection = Some(attempt.detection);
					break Ok(attempt.item);
				}
				Err(failure) => {
					log::debug!("{} via {} failed: {}", url, method, failure.error);
					if failure.detection.is_some() {
						last_detection = failure.detection;
					}
					if attempts >= max_attempts {
						break Err((failure.error, failure.reached_target));
					}
					let Some(next) = method.next() else {
						break Err((failure.error, failure.reached_target));
					};

					// A proxy only takes the blame for traffic it actually carried.
					if failure.reached_target
						&& let Some(previous) = proxy.take()
					{
						self.proxies.report_failure(&previous);
						proxy = self.proxies.select_proxy(request.country.as_deref());
						self.events.dispatch(ScraperEvent::ProxyRotated(ProxyRotatedEvent {
							domain: domain.clone(),
							previous: Some(previous.redacted_url()),
							next: proxy.as_ref().map(ProxyEndpoint::redacted_url),
							timestamp: chrono::Utc::now(),
						}));
					}
					self.events.dispatch(ScraperEvent::Retry(RetryEvent {
						domain: domain.clone(),
						attempt: attempts + 1,
						reason: failure.error,
						next_method: next,
						timestamp: chrono::Utc::now(),
					}));
					method = next;
				}
			}
		};

		let elapsed = started.elapsed();
		if let Some(ref used) = proxy {
			match result {
				Ok(_) => self.proxies.report_success(used, elapsed),
				Err((_, true)) => self.proxies.report_failure(used),
				Err((_, false)) => {}
			}
		}

		let (data, error) = match result {
			Ok(item) => (Some(item), None),
			Err((error, _)) => (None, Some(error)),
		};
		self.events.dispatch(ScraperEvent::ScrapeCompleted(ScrapeCompletedEvent {
			url: url.to_string(),
			domain,
			method,
			success: data.is_some(),
			attempts,
			latency: elapsed,
			error: error.clone(),
			timestamp: chrono::Utc::now(),
		}));

		ScrapeOutcome {
			success: data.is_some(),
			url: url.to_string(),
			method_used: method,
			proxy_used: proxy.as_ref().map(ProxyEndpoint::redacted_url),
			data,
			error,
			blockage: last_detection,
			attempts,
			execution_time: elapsed,
		}
	}

	async fn attempt(
		&self,
		request: &ScrapeRequest,
		url: &Url,
		domain: &str,
		method: ScrapeMethod,
		proxy: Option<&ProxyEndpoint>,
	) -> Result<Attempt, AttemptFailure> {
		let collector = self
			.collectors
			.get(&method)
			.ok_or_else(|| AttemptFailure::local(format!("no collector for {}", method)))?;

		let mut collect = CollectRequest::new(url.clone(), request.source_type.clone());
		collect.proxy = proxy.cloned();
		collect.stealth = request.stealth;
		collect.headless = request.headless;
		collect.timeout = request.timeout.unwrap_or(self.config.request_timeout);
		if request.stealth {
			let fingerprint = self.anti_detection.fingerprint_for(domain);
			collect.headers = self.anti_detection.stealth_headers(&fingerprint);
			collect.fingerprint = Some(fingerprint);
		}

		// Every collector, injected ones included, runs under the request timeout.
		let page = tokio::time::timeout(collect.timeout, collector.collect(&collect))
			.await
			.unwrap_or(Err(CollectError::Timeout(collect.timeout)))?;

		// API payloads carry no markup to inspect.
		let html = if page.payload.is_some() { "" } else { page.body.as_str() };
		let detection = self
			.anti_detection
			.detect_blockage(&ObservedResponse::new(page.status, &page.headers), html);

		if detection.is_blocked {
			self.events.dispatch(ScraperEvent::Blockage(BlockageEvent {
				url: url.to_string(),
				domain: domain.to_string(),
				blockage_type: detection.blockage_type,
				message: detection.message.clone(),
				timestamp: chrono::Utc::now(),
			}));
			if let Some(site_key) = detection.site_key() {
				log::debug!("{} serves a captcha (site key {})", domain, site_key);
			}
			return Err(AttemptFailure::remote(
				format!("blocked: {}", detection.blockage_type),
				Some(detection),
			));
		}
		if !page.is_success_status() {
			return Err(AttemptFailure::remote(
				format!("unexpected status {}", page.status),
				Some(detection),
			));
		}

		let item = match page.payload {
			Some(payload) => ScrapedItem::from_payload(&page.final_url, payload, method),
			None => extract_item(&page.body, &request.selectors, &page.final_url, method),
		};
		Ok(Attempt { item, detection })
	}

	/// Scrapes a registered source with its own selectors and country hint.
	pub async fn scrape_source(&self, source: &SourceRegistration) -> ScrapeOutcome {
		self.scrape(ScrapeRequest::from(source)).await
	}

	/// Registers a recurring source and echoes the applied cadence.
	pub fn register_source(&self, source: SourceRegistration) -> EngineResult<SourceRegistered> {
		if self.is_shut_down() {
			return Err(EngineError::ShutDown);
		}
		Url::parse(&source.url).map_err(|source_err| EngineError::InvalidUrl {
			url: source.url.clone(),
			source: source_err,
		})?;

		let stored = self.scheduler.add_source(source)?;
		Ok(SourceRegistered {
			source_id: stored.source_id,
			priority: stored.priority,
			frequency_secs: stored.base_frequency.as_secs(),
			enabled: stored.enabled,
		})
	}

	pub fn remove_source(&self, source_id: &str) -> bool {
		self.scheduler.remove_source(source_id)
	}

	/// Up to `count` due jobs plus scheduler counters.
	pub fn pending_sources(&self, count: usize) -> PendingSources {
		PendingSources {
			jobs: self.scheduler.next_jobs(count),
			stats: self.scheduler.stats(),
		}
	}

	pub fn health(&self) -> HealthReport {
		let pool = self.browser.pool();
		HealthReport {
			proxies: self.proxies.stats(),
			browser_pool_size: pool.as_ref().map_or(0, |pool| pool.size()),
			browser_pool_available: pool.as_ref().map_or(0, |pool| pool.available()),
			scheduler: self.scheduler.stats(),
			scheduler_running: self.scheduler.is_running(),
			captcha_solver: self.anti_detection.has_captcha_provider(),
			metrics: self.metrics.as_ref().map(MetricsCollector::snapshot),
		}
	}

	/// Probes every proxy in the pool.
	pub async fn test_proxies(&self) -> ProxyHealthCheck {
		self.proxies.health_check_all(self.probe.as_ref()).await
	}

	/// Executor running scheduled jobs through this engine.
	///
	/// Holds a weak reference, so a running scheduler never keeps a dropped
	/// engine alive.
	pub fn job_executor(self: &Arc<Self>) -> Arc<dyn JobExecutor> {
		Arc::new(EngineJobExecutor {
			engine: Arc::downgrade(self),
		})
	}

	/// Starts the scheduling loop. Returns `false` when already running.
	pub fn start_scheduler(self: &Arc<Self>) -> EngineResult<bool> {
		if self.is_shut_down() {
			return Err(EngineError::ShutDown);
		}
		Ok(self.scheduler.start(self.job_executor()))
	}

	/// Stops the scheduler and closes the browser pool.
	///
	/// Returns `false` when the engine was already shut down.
	pub async fn shutdown(&self) -> bool {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.scheduler.stop().await;
		if let Some(pool) = self.browser.take() {
			pool.close().await;
		}
		log::info!("scraping engine shut down");
		true
	}
}

struct EngineJobExecutor {
	engine: Weak<UnifiedScrapingEngine>,
}

#[async_trait]
impl JobExecutor for EngineJobExecutor {
	async fn execute(&self, job: ScrapingJob, source: SourceRegistration) -> JobReport {
		let Some(engine) = self.engine.upgrade() else {
			return JobReport::failure("engine dropped");
		};
		log::debug!("running job {} for source {}", job.id, source.source_id);

		let outcome = engine.scrape_source(&source).await;
		if let Some(sink) = &engine.sink {
			sink.store(&source, &outcome).await;
		}
		if outcome.success {
			JobReport::success()
		} else {
			JobReport::failure(outcome.error.unwrap_or_else(|| "scrape failed".into()))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collectors::RawPage;
	use crate::modules::anti_detection::BlockageType;
	use std::sync::Mutex;

	/// Collector replaying a fixed status and body, recording the proxies it saw.
	struct Scripted {
		method: ScrapeMethod,
		status: u16,
		body: &'static str,
		seen: Mutex<Vec<Option<String>>>,
	}

	impl Scripted {
		fn new(method: ScrapeMethod, status: u16, body: &'static str) -> Arc<Self> {
			Arc::new(Self {
				method,
				status,
				body,
				seen: Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl Collector for Scripted {
		fn method(&self) -> ScrapeMethod {
			self.method
		}

		async fn collect(&self, request: &CollectRequest) -> Result<RawPage, CollectError> {
			self.seen
				.lock()
				.unwrap()
				.push(request.proxy.as_ref().map(ProxyEndpoint::redacted_url));
			Ok(RawPage::html(self.status, request.url.clone(), self.body))
		}
	}

	const PAGE: &str = "<html><head><title>Acme</title></head><body><h1>Acme</h1></body></html>";

	#[tokio::test]
	async fn falls_back_when_browser_is_missing() {
		let engine = UnifiedScrapingEngine::builder()
			.with_collector(Scripted::new(ScrapeMethod::StaticFetch, 200, PAGE))
			.build()
			.unwrap();

		let outcome = engine
			.scrape(ScrapeRequest::new("https://acme.example/").with_selector("name", "h1"))
			.await;

		assert!(outcome.success, "{:?}", outcome.error);
		assert_eq!(outcome.method_used, ScrapeMethod::StaticFetch);
		assert_eq!(outcome.attempts, 2);
		let data = outcome.data.unwrap();
		assert_eq!(data.title.as_deref(), Some("Acme"));
		assert_eq!(data.fields["name"].as_text(), Some("Acme"));
		assert!(!outcome.blockage.unwrap().is_blocked);
	}

	#[tokio::test]
	async fn blocked_page_is_a_failed_attempt() {
		let engine = UnifiedScrapingEngine::builder()
			.with_primary_method(ScrapeMethod::StaticFetch)
			.with_collector(Scripted::new(ScrapeMethod::StaticFetch, 429, "slow down"))
			.build()
			.unwrap();

		let outcome = engine.scrape(ScrapeRequest::new("https://acme.example/")).await;

		assert!(!outcome.success);
		assert_eq!(outcome.method_used, ScrapeMethod::Api);
		assert_eq!(outcome.attempts, 2);
		assert!(outcome.error.as_ref().unwrap().contains("no official API"));
		assert!(outcome.is_blocked());
		assert_eq!(outcome.blockage.unwrap().blockage_type, BlockageType::RateLimit);

		let metrics = engine.metrics().unwrap().snapshot();
		assert_eq!(metrics.global.failures, 1);
		assert_eq!(metrics.global.blockages, 1);
	}

	#[tokio::test]
	async fn retry_budget_caps_attempts() {
		let engine = UnifiedScrapingEngine::builder()
			.with_max_retries(1)
			.build()
			.unwrap();

		let outcome = engine.scrape(ScrapeRequest::new("https://acme.example/")).await;
		assert!(!outcome.success);
		assert_eq!(outcome.attempts, 1);
		assert_eq!(outcome.method_used, ScrapeMethod::Browser);
	}

	#[tokio::test]
	async fn rotates_proxy_after_failure() {
		let failing = Scripted::new(ScrapeMethod::Browser, 503, "upstream down");
		let working = Scripted::new(ScrapeMethod::StaticFetch, 200, PAGE);
		// One strike quarantines, so the retry cannot land on the same endpoint.
		let engine = UnifiedScrapingEngine::builder()
			.with_proxy_config(ProxyConfig {
				max_failures: 1,
				..ProxyConfig::default()
			})
			.with_proxies([
				ProxyEndpoint::new("10.0.0.1", 8080),
				ProxyEndpoint::new("10.0.0.2", 8080),
			])
			.with_collector(failing.clone())
			.with_collector(working.clone())
			.build()
			.unwrap();

		let outcome = engine.scrape(ScrapeRequest::new("https://acme.example/")).await;
		assert!(outcome.success);

		let first = failing.seen.lock().unwrap()[0].clone().unwrap();
		let second = working.seen.lock().unwrap()[0].clone().unwrap();
		assert_ne!(first, second);
		assert_eq!(outcome.proxy_used.as_deref(), Some(second.as_str()));

		let stats = engine.proxies().stats();
		assert_eq!(stats.successful_requests, 1);
		assert_eq!(stats.failed_requests, 1);
	}

	#[tokio::test]
	async fn missing_browser_never_strikes_the_proxy() {
		let working = Scripted::new(ScrapeMethod::StaticFetch, 200, PAGE);
		let engine = UnifiedScrapingEngine::builder()
			.with_proxies([ProxyEndpoint::new("10.0.0.1", 8080)])
			.with_collector(working.clone())
			.build()
			.unwrap();

		// More scrapes than the proxy's failure allowance.
		for _ in 0..5 {
			let outcome = engine.scrape(ScrapeRequest::new("https://acme.example/")).await;
			assert!(outcome.success, "{:?}", outcome.error);
			assert_eq!(outcome.method_used, ScrapeMethod::StaticFetch);
			assert_eq!(outcome.proxy_used.as_deref(), Some("http://10.0.0.1:8080"));
		}

		let stats = engine.proxies().stats();
		assert_eq!(stats.successful_requests, 5);
		assert_eq!(stats.failed_requests, 0);
		assert_eq!(stats.blacklisted_proxies, 0);
		assert!(engine.proxies().select_proxy(None).is_some());
	}

	struct Hanging;

	#[async_trait]
	impl Collector for Hanging {
		fn method(&self) -> ScrapeMethod {
			ScrapeMethod::StaticFetch
		}

		async fn collect(&self, _request: &CollectRequest) -> Result<RawPage, CollectError> {
			std::future::pending::<Result<RawPage, CollectError>>().await
		}
	}

	#[tokio::test(start_paused = true)]
	async fn hanging_collector_is_cut_at_request_timeout() {
		let engine = UnifiedScrapingEngine::builder()
			.with_primary_method(ScrapeMethod::StaticFetch)
			.with_request_timeout(Duration::from_secs(5))
			.with_proxies([ProxyEndpoint::new("10.0.0.1", 8080)])
			.with_collector(Arc::new(Hanging))
			.build()
			.unwrap();

		let outcome = tokio::time::timeout(
			Duration::from_secs(3600),
			engine.scrape(ScrapeRequest::new("https://acme.example/")),
		)
		.await
		.expect("scrape finishes");

		assert!(!outcome.success);
		assert_eq!(outcome.attempts, 2);
		assert_eq!(outcome.method_used, ScrapeMethod::Api);
		assert!(outcome.execution_time >= Duration::from_secs(5));
		assert!(outcome.execution_time < Duration::from_secs(6));
		// The timed out fetch went through the proxy; the missing API did not.
		assert_eq!(engine.proxies().stats().failed_requests, 1);
	}

	#[tokio::test]
	async fn invalid_url_is_reported_not_raised() {
		let engine = UnifiedScrapingEngine::new().unwrap();
		let outcome = engine.scrape(ScrapeRequest::new("not a url")).await;
		assert!(!outcome.success);
		assert_eq!(outcome.attempts, 0);
		assert!(outcome.error.unwrap().starts_with("invalid url"));
	}

	#[tokio::test]
	async fn register_source_echoes_applied_cadence() {
		let engine = UnifiedScrapingEngine::new().unwrap();
		let applied = engine
			.register_source(
				SourceRegistration::new("s1", "brand", "https://acme.example/reviews", "review")
					.with_priority(Priority::High)
					.with_frequency(Duration::from_secs(60)),
			)
			.unwrap();
		assert_eq!(applied.priority, Priority::High);
		assert_eq!(applied.frequency_secs, 300);

		let pending = engine.pending_sources(10);
		assert_eq!(pending.jobs.len(), 1);
		assert_eq!(pending.stats.registered_sources, 1);

		let bad = engine.register_source(SourceRegistration::new("s2", "brand", "::", "review"));
		assert!(matches!(bad, Err(EngineError::InvalidUrl { .. })));
	}

	#[tokio::test]
	async fn shutdown_is_idempotent() {
		let engine = Arc::new(UnifiedScrapingEngine::new().unwrap());
		assert!(engine.start_scheduler().unwrap());
		assert!(engine.health().scheduler_running);

		assert!(engine.shutdown().await);
		assert!(!engine.shutdown().await);
		assert!(!engine.health().scheduler_running);

		let outcome = engine.scrape(ScrapeRequest::new("https://acme.example/")).await;
		assert_eq!(outcome.error.as_deref(), Some("engine is shut down"));
		assert!(matches!(engine.start_scheduler(), Err(EngineError::ShutDown)));
	}

	#[test]
	fn outcome_serializes_for_callers() {
		let outcome = ScrapeOutcome::rejected(
			"https://acme.example/",
			ScrapeMethod::Browser,
			"boom".into(),
			Instant::now(),
		);
		let json = serde_json::to_value(&outcome).unwrap();
		assert_eq!(json["method_used"], "browser");
		assert!(json["blockage_detected"].is_null());
		assert!(json["execution_time"].is_f64());
	}
}
