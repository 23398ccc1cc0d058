//! Integrations that rely on third-party services.
//!
//! Currently the CAPTCHA solving brokers used when a target serves a
//! challenge the collectors cannot pass on their own.

pub mod captcha;

pub use captcha::TwoCaptchaProvider;
