//! Settings and configuration module
//!
//! Environment-sourced settings for the proxy pool and the CAPTCHA broker.
//! Component level knobs live next to their component (`ProxyConfig`,
//! `RateLimitConfig`, `SchedulerConfig`, ...); this module only turns process
//! environment into those values.

use std::time::Duration;

use thiserror::Error;

use crate::modules::proxy::{ProxyEndpoint, ProxyProvider};

pub const ENV_PROXY_PROVIDER: &str = "PROXY_PROVIDER";
pub const ENV_PROXY_API_KEY: &str = "PROXY_API_KEY";
pub const ENV_STATIC_PROXIES: &str = "STATIC_PROXIES";
pub const ENV_PROXY_MAX_FAILURES: &str = "PROXY_MAX_FAILURES";
pub const ENV_PROXY_COOLDOWN_SECS: &str = "PROXY_COOLDOWN_SECS";
pub const ENV_CAPTCHA_PROVIDER: &str = "CAPTCHA_PROVIDER";
pub const ENV_CAPTCHA_API_KEY: &str = "CAPTCHA_API_KEY";
pub const ENV_CAPTCHA_TIMEOUT_SECS: &str = "CAPTCHA_TIMEOUT_SECS";
pub const ENV_CAPTCHA_POLL_INTERVAL_SECS: &str = "CAPTCHA_POLL_INTERVAL_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown proxy provider `{0}`")]
    UnknownProxyProvider(String),
    #[error("unknown captcha provider `{0}`")]
    UnknownCaptchaProvider(String),
    #[error("{key} must be a positive integer, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxySettings {
    pub provider: ProxyProvider,
    pub api_key: Option<String>,
    pub proxies: Vec<ProxyEndpoint>,
    pub max_failures: u32,
    pub cooldown: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            provider: ProxyProvider::Static,
            api_key: None,
            proxies: Vec::new(),
            max_failures: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Supported CAPTCHA solving vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaVendor {
    TwoCaptcha,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSettings {
    pub vendor: CaptchaVendor,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            vendor: CaptchaVendor::TwoCaptcha,
            api_key: None,
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl CaptchaSettings {
    /// Credentials are present, so a provider can be built.
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScraperSettings {
    pub proxy: ProxySettings,
    pub captcha: CaptchaSettings,
}

impl ScraperSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses settings from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = match get(ENV_PROXY_PROVIDER) {
            Some(raw) => raw.parse::<ProxyProvider>()?,
            None => ProxyProvider::Static,
        };

        let proxies = get(ENV_STATIC_PROXIES)
            .map(|raw| parse_proxy_list(&raw))
            .unwrap_or_default();

        let defaults = ProxySettings::default();
        let proxy = ProxySettings {
            provider,
            api_key: get(ENV_PROXY_API_KEY),
            proxies,
            max_failures: match parse_number(ENV_PROXY_MAX_FAILURES, get(ENV_PROXY_MAX_FAILURES))? {
                Some(n) => u32::try_from(n).map_err(|_| ConfigError::InvalidNumber {
                    key: ENV_PROXY_MAX_FAILURES,
                    value: n.to_string(),
                })?,
                None => defaults.max_failures,
            },
            cooldown: parse_number(ENV_PROXY_COOLDOWN_SECS, get(ENV_PROXY_COOLDOWN_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
        };

        let vendor = match get(ENV_CAPTCHA_PROVIDER).as_deref() {
            None | Some("2captcha") | Some("twocaptcha") => CaptchaVendor::TwoCaptcha,
            Some(other) => return Err(ConfigError::UnknownCaptchaProvider(other.to_string())),
        };

        let captcha_defaults = CaptchaSettings::default();
        let captcha = CaptchaSettings {
            vendor,
            api_key: get(ENV_CAPTCHA_API_KEY),
            timeout: parse_number(ENV_CAPTCHA_TIMEOUT_SECS, get(ENV_CAPTCHA_TIMEOUT_SECS))?
                .map(Duration::from_secs)
                .unwrap_or(captcha_defaults.timeout),
            poll_interval: parse_number(
                ENV_CAPTCHA_POLL_INTERVAL_SECS,
                get(ENV_CAPTCHA_POLL_INTERVAL_SECS),
            )?
            .map(Duration::from_secs)
            .unwrap_or(captcha_defaults.poll_interval),
        };

        Ok(Self { proxy, captcha })
    }
}

/// Parses a comma separated `host:port[:protocol]` list, skipping bad entries.
pub fn parse_proxy_list(raw: &str) -> Vec<ProxyEndpoint> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match ProxyEndpoint::parse(entry) {
            Ok(endpoint) => Some(endpoint),
            Err(err) => {
                log::warn!("skipping proxy entry: {}", err);
                None
            }
        })
        .collect()
}

fn parse_number(key: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => match value.parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConfigError::InvalidNumber { key, value }),
        },
    }
}
