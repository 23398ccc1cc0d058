//! Blockage classification.
//!
//! Status codes are checked first, then the page body is scanned against an
//! ordered table of markers; the first category with a hit wins. Cloudflare
//! response headers are the last resort signal.

use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Categories of automated-access blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockageType {
    None,
    Cloudflare,
    CaptchaV2,
    CaptchaV3,
    HCaptcha,
    Waf,
    RateLimit,
    IpBlocked,
    Unknown,
}

impl BlockageType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockageType::None => "none",
            BlockageType::Cloudflare => "cloudflare",
            BlockageType::CaptchaV2 => "captcha_v2",
            BlockageType::CaptchaV3 => "captcha_v3",
            BlockageType::HCaptcha => "h_captcha",
            BlockageType::Waf => "waf",
            BlockageType::RateLimit => "rate_limit",
            BlockageType::IpBlocked => "ip_blocked",
            BlockageType::Unknown => "unknown",
        }
    }

    /// Ranked remediation steps for this category.
    pub fn remediations(self) -> &'static [&'static str] {
        match self {
            BlockageType::None => &[],
            BlockageType::Cloudflare => &[
                "use stealth browser automation",
                "rotate proxy (different IP)",
                "wait a few minutes",
                "use a headed browser",
            ],
            BlockageType::CaptchaV2 => &[
                "solve the captcha through a solving service",
                "use residential proxies",
                "simulate human behaviour",
            ],
            BlockageType::CaptchaV3 => &[
                "use high quality proxies",
                "simulate human actions",
                "collect tokens through a solving service",
            ],
            BlockageType::HCaptcha => &[
                "solve the captcha through a solving service",
                "use residential proxies",
            ],
            BlockageType::Waf => &[
                "rotate proxy",
                "change request headers",
                "reduce request frequency",
            ],
            BlockageType::RateLimit => &[
                "reduce request frequency",
                "rotate proxies",
                "apply exponential backoff",
            ],
            BlockageType::IpBlocked => &[
                "change IP immediately",
                "use residential proxies",
                "wait 24-48h for the ban to lift",
            ],
            BlockageType::Unknown => &["inspect the response manually"],
        }
    }
}

impl fmt::Display for BlockageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured classification of a single response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub is_blocked: bool,
    pub blockage_type: BlockageType,
    pub message: String,
    pub details: BTreeMap<String, String>,
    pub solutions: Vec<String>,
}

impl DetectionResult {
    pub fn clear() -> Self {
        Self {
            is_blocked: false,
            blockage_type: BlockageType::None,
            message: "no blockage detected".into(),
            details: BTreeMap::new(),
            solutions: Vec::new(),
        }
    }

    pub fn blocked(blockage_type: BlockageType, message: impl Into<String>) -> Self {
        Self {
            is_blocked: true,
            blockage_type,
            message: message.into(),
            details: BTreeMap::new(),
            solutions: blockage_type
                .remediations()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Site key scraped from `data-sitekey`, when the page embeds a captcha.
    pub fn site_key(&self) -> Option<&str> {
        self.details.get("site_key").map(String::as_str)
    }
}

/// Status line and headers of a fetched page.
#[derive(Debug, Clone, Copy)]
pub struct ObservedResponse<'a> {
    pub status: u16,
    pub headers: &'a HeaderMap,
}

impl<'a> ObservedResponse<'a> {
    pub fn new(status: u16, headers: &'a HeaderMap) -> Self {
        Self { status, headers }
    }
}

/// Ordered marker table; earlier rows win.
static BLOCKAGE_PATTERNS: &[(BlockageType, &[&str])] = &[
    (
        BlockageType::Cloudflare,
        &[
            "cloudflare",
            "checking your browser",
            "just a moment",
            "cf-ray",
            "__cf_bm",
            "cf-clearance",
        ],
    ),
    (
        BlockageType::CaptchaV2,
        &["recaptcha", "g-recaptcha", "data-sitekey", "recaptcha/api.js"],
    ),
    (BlockageType::CaptchaV3, &["recaptcha", " grecaptcha"]),
    (BlockageType::HCaptcha, &["hcaptcha", "h-captcha", "data-sitekey"]),
    (
        BlockageType::Waf,
        &[
            "403 forbidden",
            "access denied",
            "security check",
            "blocked",
            "suspicious activity",
        ],
    ),
    (
        BlockageType::RateLimit,
        &["rate limit", "too many requests", "429", "please wait"],
    ),
    (BlockageType::IpBlocked, &["ip blocked", "banned", "blocked ip"]),
];

static CLOUDFLARE_HEADERS: &[&str] = &["cf-ray", "cf-clearance"];

static SITE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#)
        .case_insensitive(true)
        .build()
        .expect("invalid site key regex")
});

/// Classifies a response. Pure function of its inputs.
pub fn classify(response: &ObservedResponse<'_>, html: &str) -> DetectionResult {
    let status = response.status.to_string();

    match response.status {
        403 => {
            return DetectionResult::blocked(BlockageType::Waf, "WAF blocked (403)")
                .with_detail("status", status);
        }
        429 => {
            return DetectionResult::blocked(BlockageType::RateLimit, "rate limited (429)")
                .with_detail("status", status);
        }
        _ => {}
    }

    let lowered = html.to_lowercase();
    for (blockage_type, patterns) in BLOCKAGE_PATTERNS {
        if let Some(pattern) = patterns.iter().find(|pattern| lowered.contains(**pattern)) {
            let mut result =
                DetectionResult::blocked(*blockage_type, format!("detected {}", blockage_type))
                    .with_detail("pattern", *pattern)
                    .with_detail("status", status);
            if let Some(site_key) = extract_site_key(html) {
                result = result.with_detail("site_key", site_key);
            }
            return result;
        }
    }

    if let Some(header) = CLOUDFLARE_HEADERS
        .iter()
        .find(|name| response.headers.contains_key(**name))
    {
        return DetectionResult::blocked(BlockageType::Cloudflare, "cloudflare protection")
            .with_detail("header", *header)
            .with_detail("status", status);
    }

    DetectionResult::clear()
}

pub fn extract_site_key(html: &str) -> Option<String> {
    SITE_KEY_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
