//! Captcha provider integrations.
//!
//! Solving services work in two steps: a task is submitted and the caller
//! polls for the token. Providers implement both halves; [`solve`] drives
//! them under a hard deadline so a slow vendor can never stall a scrape.

mod twocaptcha;

pub use twocaptcha::TwoCaptchaProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::{CaptchaSettings, CaptchaVendor};

/// Controls how long and how often a solution is awaited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl From<&CaptchaSettings> for CaptchaConfig {
    fn from(settings: &CaptchaSettings) -> Self {
        Self {
            timeout: settings.timeout,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Widget family embedded in the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptchaKind {
    #[default]
    ReCaptchaV2,
    ReCaptchaV3,
    HCaptcha,
}

#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: Url,
    pub action: Option<String>,
    pub data: HashMap<String, String>,
}

impl CaptchaTask {
    pub fn new(site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            kind: CaptchaKind::default(),
            site_key: site_key.into(),
            page_url,
            action: None,
            data: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: CaptchaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Vendor-side identifier of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptchaJobId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub token: String,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            metadata: HashMap::new(),
        }
    }
}

/// State of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaPoll {
    Ready(CaptchaSolution),
    Pending,
}

pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn submit(&self, task: &CaptchaTask) -> Result<CaptchaJobId, CaptchaError>;
    async fn poll(&self, job: &CaptchaJobId) -> Result<CaptchaPoll, CaptchaError>;
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Builds the provider named by `settings`, or `None` without credentials.
pub fn provider_from_settings(settings: &CaptchaSettings) -> Option<Arc<dyn CaptchaProvider>> {
    let api_key = settings.api_key.as_deref().filter(|_| settings.is_configured())?;
    match settings.vendor {
        CaptchaVendor::TwoCaptcha => Some(Arc::new(TwoCaptchaProvider::new(api_key))),
    }
}

/// Submits `task` and polls until a token arrives or `config.timeout` elapses.
pub async fn solve(
    provider: &dyn CaptchaProvider,
    task: &CaptchaTask,
    config: &CaptchaConfig,
) -> CaptchaResult {
    let attempt = async {
        let job = provider.submit(task).await?;
        log::debug!("{} accepted captcha task {}", provider.name(), job.0);
        loop {
            tokio::time::sleep(config.poll_interval).await;
            match provider.poll(&job).await? {
                CaptchaPoll::Ready(solution) => return Ok(solution),
                CaptchaPoll::Pending => continue,
            }
        }
    };

    match tokio::time::timeout(config.timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(CaptchaError::Timeout(config.timeout)),
    }
}
