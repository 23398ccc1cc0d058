//! Official API collection, dispatched on the source type.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CollectError, CollectRequest, Collector, RawPage, ScrapeMethod};

/// A vendor API able to return structured data for one source type.
#[async_trait]
pub trait OfficialApi: Send + Sync {
    /// Source type tag this API serves, e.g. `trustpilot`.
    fn source_type(&self) -> &str;

    async fn fetch(&self, request: &CollectRequest) -> Result<serde_json::Value, CollectError>;
}

#[derive(Default)]
pub struct ApiCollector {
    apis: HashMap<String, Arc<dyn OfficialApi>>,
}

impl std::fmt::Debug for ApiCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<_> = self.apis.keys().collect();
        registered.sort();
        f.debug_struct("ApiCollector")
            .field("registered", &registered)
            .finish()
    }
}

impl ApiCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `api` for its source type, replacing any previous one.
    pub fn register(&mut self, api: Arc<dyn OfficialApi>) {
        let key = api.source_type().to_ascii_lowercase();
        if self.apis.insert(key.clone(), api).is_some() {
            log::warn!("official API for `{}` replaced", key);
        }
    }

    pub fn supports(&self, source_type: &str) -> bool {
        self.apis.contains_key(&source_type.to_ascii_lowercase())
    }
}

#[async_trait]
impl Collector for ApiCollector {
    fn method(&self) -> ScrapeMethod {
        ScrapeMethod::Api
    }

    async fn collect(&self, request: &CollectRequest) -> Result<RawPage, CollectError> {
        let api = self
            .apis
            .get(&request.source_type.to_ascii_lowercase())
            .ok_or_else(|| {
                CollectError::Unavailable(format!(
                    "no official API for source type `{}`",
                    request.source_type
                ))
            })?;
        let payload = tokio::time::timeout(request.timeout, api.fetch(request))
            .await
            .map_err(|_| CollectError::Timeout(request.timeout))??;
        Ok(RawPage::json(request.url.clone(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    struct ReviewsApi;

    #[async_trait]
    impl OfficialApi for ReviewsApi {
        fn source_type(&self) -> &str {
            "Trustpilot"
        }

        async fn fetch(&self, request: &CollectRequest) -> Result<serde_json::Value, CollectError> {
            Ok(json!({ "url": request.url.as_str(), "reviews": [] }))
        }
    }

    fn request(source_type: &str) -> CollectRequest {
        CollectRequest::new(Url::parse("https://example.com/reviews").unwrap(), source_type)
    }

    #[tokio::test]
    async fn dispatches_on_source_type() {
        let mut collector = ApiCollector::new();
        collector.register(Arc::new(ReviewsApi));
        assert!(collector.supports("trustpilot"));

        let page = collector.collect(&request("trustpilot")).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.body.is_empty());
        assert_eq!(page.payload.unwrap()["reviews"], json!([]));
    }

    #[tokio::test]
    async fn unknown_source_type_is_unavailable() {
        let collector = ApiCollector::new();
        let err = collector.collect(&request("google")).await.unwrap_err();
        assert!(err.to_string().contains("no official API"));
    }
}
