//! Browser fingerprint spoofing utilities.
//!
//! Generates browser identities whose parts agree with each other: the user
//! agent matches the navigator platform and the timezone matches the locale.
//! A [`ConsistencyLevel`] decides whether repeated visits reuse an identity.

use chrono::{DateTime, Utc};
use rand::{Rng, seq::SliceRandom};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenProfile {
    pub width: u16,
    pub height: u16,
    pub color_depth: u8,
    pub pixel_ratio: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserFingerprint {
    pub screen: ScreenProfile,
    pub timezone: String,
    pub language: String,
    pub platform: String,
    pub hardware_concurrency: u8,
    pub device_memory: u8,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

impl BrowserFingerprint {
    /// Primary locale tag, e.g. `fr-FR` for `fr-FR,fr;q=0.9,en;q=0.8`.
    pub fn primary_locale(&self) -> &str {
        self.language.split(',').next().unwrap_or("en-US")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    None,
    Domain,
    Global,
}

/// Hands out fingerprints, caching them per domain or globally.
#[derive(Debug)]
pub struct FingerprintGenerator {
    consistency: ConsistencyLevel,
    cache: HashMap<String, BrowserFingerprint>,
    global: Option<BrowserFingerprint>,
}

impl FingerprintGenerator {
    pub fn new(consistency: ConsistencyLevel) -> Self {
        Self {
            consistency,
            cache: HashMap::new(),
            global: None,
        }
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.consistency
    }

    pub fn generate_for(&mut self, domain: &str) -> BrowserFingerprint {
        match self.consistency {
            ConsistencyLevel::None => random_fingerprint(),
            ConsistencyLevel::Global => self.global.get_or_insert_with(random_fingerprint).clone(),
            ConsistencyLevel::Domain => self
                .cache
                .entry(domain.to_ascii_lowercase())
                .or_insert_with(random_fingerprint)
                .clone(),
        }
    }

    /// Forgets the identity used for `domain`, typically after it got blocked.
    pub fn invalidate(&mut self, domain: &str) {
        self.cache.remove(&domain.to_ascii_lowercase());
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new(ConsistencyLevel::Domain)
    }
}

struct PlatformTemplate {
    navigator: &'static str,
    user_agents: &'static [&'static str],
    pixel_ratios: &'static [f32],
}

struct LocaleProfile {
    language: &'static str,
    timezones: &'static [&'static str],
}

const RESOLUTIONS: &[(u16, u16)] = &[(1920, 1080), (1366, 768), (1536, 864), (1440, 900), (1280, 720)];
const COLOR_DEPTHS: &[u8] = &[24, 32];
const HARDWARE_CONCURRENCY: &[u8] = &[2, 4, 8, 16];
const DEVICE_MEMORY: &[u8] = &[2, 4, 8];

const PLATFORMS: &[PlatformTemplate] = &[
    PlatformTemplate {
        navigator: "Win32",
        user_agents: &[
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        ],
        pixel_ratios: &[1.0, 1.25, 1.5],
    },
    PlatformTemplate {
        navigator: "MacIntel",
        user_agents: &[
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        ],
        pixel_ratios: &[1.0, 2.0],
    },
    PlatformTemplate {
        navigator: "Linux x86_64",
        user_agents: &[
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        ],
        pixel_ratios: &[1.0, 1.25],
    },
];

const LOCALES: &[LocaleProfile] = &[
    LocaleProfile {
        language: "fr-FR,fr;q=0.9,en;q=0.8",
        timezones: &["Europe/Paris"],
    },
    LocaleProfile {
        language: "en-US,en;q=0.9,fr;q=0.8",
        timezones: &["America/New_York", "America/Los_Angeles"],
    },
    LocaleProfile {
        language: "en-GB,en;q=0.9",
        timezones: &["Europe/London", "Europe/Berlin"],
    },
];

/// Fresh random identity, independent of any cache.
pub fn random_fingerprint() -> BrowserFingerprint {
    let mut rng = rand::thread_rng();
    let platform = &PLATFORMS[rng.gen_range(0..PLATFORMS.len())];
    let locale = &LOCALES[rng.gen_range(0..LOCALES.len())];
    let (width, height) = RESOLUTIONS.choose(&mut rng).copied().unwrap_or((1920, 1080));

    BrowserFingerprint {
        screen: ScreenProfile {
            width,
            height,
            color_depth: COLOR_DEPTHS.choose(&mut rng).copied().unwrap_or(24),
            pixel_ratio: platform.pixel_ratios.choose(&mut rng).copied().unwrap_or(1.0),
        },
        timezone: locale
            .timezones
            .choose(&mut rng)
            .copied()
            .unwrap_or("Europe/Paris")
            .to_string(),
        language: locale.language.to_string(),
        platform: platform.navigator.to_string(),
        hardware_concurrency: HARDWARE_CONCURRENCY.choose(&mut rng).copied().unwrap_or(4),
        device_memory: DEVICE_MEMORY.choose(&mut rng).copied().unwrap_or(4),
        user_agent: platform
            .user_agents
            .choose(&mut rng)
            .copied()
            .unwrap_or(platform.user_agents[0])
            .to_string(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_token(platform: &str) -> &'static str {
        match platform {
            "Win32" => "Windows NT",
            "MacIntel" => "Macintosh",
            _ => "Linux x86_64",
        }
    }

    #[test]
    fn fingerprints_are_internally_consistent() {
        for _ in 0..200 {
            let fp = random_fingerprint();
            assert!(fp.user_agent.contains(os_token(&fp.platform)), "{fp:?}");
            assert!(RESOLUTIONS.contains(&(fp.screen.width, fp.screen.height)));
            assert!([1.0, 1.25, 1.5, 2.0].contains(&fp.screen.pixel_ratio));
            let locale = LOCALES
                .iter()
                .find(|l| l.language == fp.language)
                .expect("known locale");
            assert!(locale.timezones.contains(&fp.timezone.as_str()));
        }
    }

    #[test]
    fn generates_consistent_domain_fingerprints() {
        let mut generator = FingerprintGenerator::default();
        let first = generator.generate_for("example.com");
        let again = generator.generate_for("EXAMPLE.com");
        assert_eq!(first, again);

        generator.invalidate("example.com");
        let fresh = generator.generate_for("example.com");
        assert!(fresh.created_at >= first.created_at);
    }

    #[test]
    fn global_consistency_shares_identity() {
        let mut generator = FingerprintGenerator::new(ConsistencyLevel::Global);
        assert_eq!(generator.generate_for("a.test"), generator.generate_for("b.test"));
    }

    #[test]
    fn serializes_with_navigator_names() {
        let value = serde_json::to_value(random_fingerprint()).unwrap();
        assert!(value["screen"]["colorDepth"].is_number());
        assert!(value["hardwareConcurrency"].is_number());
    }
}
