use super::{CaptchaError, CaptchaJobId, CaptchaKind, CaptchaPoll, CaptchaProvider, CaptchaSolution, CaptchaTask};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const DEFAULT_ENDPOINT: &str = "http://2captcha.com/";
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Adapter for the 2Captcha `in.php` / `res.php` API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    endpoint: Url,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: i64,
    request: String,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let endpoint = Url::parse(DEFAULT_ENDPOINT).expect("static 2captcha endpoint");
        Self::with_endpoint(api_key, endpoint)
    }

    pub fn with_endpoint(api_key: impl Into<String>, endpoint: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.into(),
            endpoint,
            client,
        }
    }

    fn url(&self, path: &str) -> Result<Url, CaptchaError> {
        self.endpoint
            .join(path)
            .map_err(|err| CaptchaError::Configuration(err.to_string()))
    }

    fn submit_form(&self, task: &CaptchaTask) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("key", self.api_key.clone()),
            ("pageurl", task.page_url.to_string()),
            ("json", "1".to_string()),
        ];
        match task.kind {
            CaptchaKind::ReCaptchaV2 => {
                form.push(("method", "userrecaptcha".into()));
                form.push(("googlekey", task.site_key.clone()));
            }
            CaptchaKind::ReCaptchaV3 => {
                form.push(("method", "userrecaptcha".into()));
                form.push(("version", "v3".into()));
                form.push(("googlekey", task.site_key.clone()));
                if let Some(action) = &task.action {
                    form.push(("action", action.clone()));
                }
            }
            CaptchaKind::HCaptcha => {
                form.push(("method", "hcaptcha".into()));
                form.push(("sitekey", task.site_key.clone()));
            }
        }
        form
    }
}

fn interpret_submit(reply: Reply) -> Result<CaptchaJobId, CaptchaError> {
    if reply.status == 1 {
        Ok(CaptchaJobId(reply.request))
    } else {
        Err(CaptchaError::Provider(reply.request))
    }
}

fn interpret_poll(reply: Reply) -> Result<CaptchaPoll, CaptchaError> {
    match (reply.status, reply.request.as_str()) {
        (1, _) => Ok(CaptchaPoll::Ready(CaptchaSolution::new(reply.request))),
        (_, NOT_READY) => Ok(CaptchaPoll::Pending),
        _ => Err(CaptchaError::Provider(reply.request)),
    }
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "2captcha"
    }

    async fn submit(&self, task: &CaptchaTask) -> Result<CaptchaJobId, CaptchaError> {
        let reply: Reply = self
            .client
            .post(self.url("in.php")?)
            .form(&self.submit_form(task))
            .send()
            .await?
            .json()
            .await?;
        interpret_submit(reply)
    }

    async fn poll(&self, job: &CaptchaJobId) -> Result<CaptchaPoll, CaptchaError> {
        let reply: Reply = self
            .client
            .get(self.url("res.php")?)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", job.0.as_str()),
                ("json", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;
        interpret_poll(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: i64, request: &str) -> Reply {
        Reply {
            status,
            request: request.to_string(),
        }
    }

    #[test]
    fn not_ready_is_pending() {
        assert_eq!(interpret_poll(reply(0, NOT_READY)).unwrap(), CaptchaPoll::Pending);
    }

    #[test]
    fn ready_carries_token() {
        match interpret_poll(reply(1, "03AGdBq2")).unwrap() {
            CaptchaPoll::Ready(solution) => assert_eq!(solution.token, "03AGdBq2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn vendor_errors_surface() {
        assert!(matches!(
            interpret_poll(reply(0, "ERROR_CAPTCHA_UNSOLVABLE")),
            Err(CaptchaError::Provider(_))
        ));
        assert!(matches!(
            interpret_submit(reply(0, "ERROR_WRONG_USER_KEY")),
            Err(CaptchaError::Provider(_))
        ));
    }

    #[test]
    fn hcaptcha_form_uses_sitekey() {
        let provider = TwoCaptchaProvider::new("k");
        let task = CaptchaTask::new("abc", Url::parse("https://example.com").unwrap())
            .with_kind(CaptchaKind::HCaptcha);
        let form = provider.submit_form(&task);
        assert!(form.contains(&("method", "hcaptcha".to_string())));
        assert!(form.contains(&("sitekey", "abc".to_string())));
    }
}
