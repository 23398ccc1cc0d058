//! Plain HTTP collection with per-proxy client reuse.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{CollectError, CollectRequest, Collector, RawPage, ScrapeMethod};
use crate::modules::proxy::ProxyEndpoint;

/// Reqwest client pool keyed by proxy endpoint.
#[derive(Debug, Default)]
struct ClientPool {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ClientPool {
    async fn get(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, CollectError> {
        let key = proxy.map(ProxyEndpoint::url);
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|err| CollectError::InvalidProxy {
                proxy: endpoint.redacted_url(),
                reason: err.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Fetches the page over HTTP without rendering it.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    pool: ClientPool,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct clients built so far, one per proxy.
    pub async fn client_count(&self) -> usize {
        self.pool.len().await
    }
}

#[async_trait]
impl Collector for StaticFetcher {
    fn method(&self) -> ScrapeMethod {
        ScrapeMethod::StaticFetch
    }

    async fn collect(&self, request: &CollectRequest) -> Result<RawPage, CollectError> {
        let client = self.pool.get(request.proxy.as_ref()).await?;
        let response = client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CollectError::Timeout(request.timeout)
                } else {
                    CollectError::Http(err)
                }
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response.text().await?;
        log::debug!("static fetch {} -> {} ({} bytes)", final_url, status, body.len());

        Ok(RawPage::html(status, final_url, body).with_headers(headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_one_client_per_proxy() {
        let pool = ClientPool::default();
        let proxy = ProxyEndpoint::new("10.0.0.1", 8080);

        pool.get(None).await.unwrap();
        pool.get(None).await.unwrap();
        pool.get(Some(&proxy)).await.unwrap();
        pool.get(Some(&proxy)).await.unwrap();

        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn rejects_unusable_proxy_url() {
        let pool = ClientPool::default();
        let proxy = ProxyEndpoint::new("bad host", 8080).with_protocol("not a scheme");

        let err = pool.get(Some(&proxy)).await.unwrap_err();
        assert!(matches!(err, CollectError::InvalidProxy { .. }));
        assert_eq!(pool.len().await, 0);
    }
}
