//! Content-addressed payload exchange. Inputs are fetched from an IPFS-style
//! gateway; results are uploaded through the add API when one is configured.
//! The resolver keeps a small in-memory cache and falls back to a fixed,
//! deterministically selected sample corpus when the store is unreachable.
//! The fallback is a development/demo convenience that keeps the pipeline
//! exercisable, not a production guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::keccak256;
use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result};
use mockall::automock;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Capability for fetching and publishing content-addressed payloads.
#[automock]
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch(&self, hash: &str) -> Result<Vec<u8>>;

    async fn upload(&self, data: Vec<u8>) -> Result<String>;
}

/// HTTP client against an IPFS gateway (reads) and the add API (writes).
pub struct IpfsGatewayClient {
    http: reqwest::Client,
    gateway_url: Url,
    api_url: Option<Url>,
}

impl IpfsGatewayClient {
    pub fn new(gateway_url: Url, api_url: Option<Url>) -> Self {
        Self { http: reqwest::Client::new(), gateway_url, api_url }
    }
}

#[async_trait]
impl ContentStore for IpfsGatewayClient {
    async fn fetch(&self, hash: &str) -> Result<Vec<u8>> {
        let url = self.gateway_url.join(&format!("ipfs/{hash}"))?;
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(&self, data: Vec<u8>) -> Result<String> {
        let api_url = self.api_url.as_ref().ok_or_else(|| eyre!("no content store API endpoint configured"))?;
        let url = api_url.join("api/v0/add")?;
        let part = reqwest::multipart::Part::bytes(data).file_name("payload");
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self.http.post(url).multipart(form).send().await?.error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body.get("Hash")
            .and_then(|hash| hash.as_str())
            .map(str::to_string)
            .ok_or_else(|| eyre!("content store add response carried no hash"))
    }
}

/// Sample corpus used when the content store cannot serve an input payload.
const SAMPLE_INPUTS: &[&str] = &[
    "CONGRATULATIONS! You've WON $1,000,000! Click here NOW!!!",
    "GET RICH QUICK! Amazing investment opportunity!",
    "FREE MONEY! Limited time offer! Act now!",
    "URGENT: Your account needs verification",
    "Hi John, let's meet for coffee tomorrow at 3pm.",
    "Meeting reminder: Team sync at 10am",
    "Your order has been shipped. Tracking: ABC123",
    "Thanks for your email. I'll get back to you soon.",
];

fn sample_input(input_data_hash: &str) -> &'static str {
    let digest = keccak256(input_data_hash.as_bytes());
    SAMPLE_INPUTS[digest[0] as usize % SAMPLE_INPUTS.len()]
}

/// Input/output payload resolution in front of a [`ContentStore`].
pub struct PayloadStore {
    store: Arc<dyn ContentStore>,
    cache: RwLock<HashMap<String, Arc<str>>>,
}

impl PayloadStore {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()) }
    }

    /// Resolves an input payload: local cache, then the content store, then
    /// the deterministic sample fallback. Never fails.
    pub async fn resolve(&self, input_data_hash: &str) -> String {
        if let Some(hit) = self.cache.read().await.get(input_data_hash) {
            debug!(input_data_hash, "Input payload served from cache");
            return hit.to_string();
        }
        match self.store.fetch(input_data_hash).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.cache.write().await.insert(input_data_hash.to_string(), Arc::from(text.as_str()));
                text
            }
            Err(e) => {
                warn!(input_data_hash, error = %e, "Content store fetch failed, using deterministic sample input");
                sample_input(input_data_hash).to_string()
            }
        }
    }

    /// Publishes a result payload, falling back to a content digest as the
    /// result hash when the store rejects the upload.
    pub async fn store_result(&self, data: &[u8]) -> String {
        match self.store.upload(data.to_vec()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "Result upload failed, falling back to content digest");
                keccak256(data).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn gateway_client(server: &MockServer, with_api: bool) -> IpfsGatewayClient {
        let base: Url = server.base_url().parse().unwrap();
        IpfsGatewayClient::new(base.clone(), with_api.then_some(base))
    }

    #[tokio::test]
    async fn fetch_reads_from_the_gateway_path() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/ipfs/QmInput");
            then.status(200).body("hello spam");
        });

        let client = gateway_client(&server, false);
        let bytes = client.fetch("QmInput").await.unwrap();

        mock.assert();
        assert_eq!(bytes, b"hello spam");
    }

    #[tokio::test]
    async fn fetch_propagates_gateway_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/ipfs/QmMissing");
            then.status(404);
        });

        let client = gateway_client(&server, false);
        assert!(client.fetch("QmMissing").await.is_err());
    }

    #[tokio::test]
    async fn upload_returns_the_reported_hash() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/v0/add");
            then.status(200).json_body(serde_json::json!({ "Hash": "QmResult", "Size": "11" }));
        });

        let client = gateway_client(&server, true);
        let hash = client.upload(b"result data".to_vec()).await.unwrap();

        mock.assert();
        assert_eq!(hash, "QmResult");
    }

    #[tokio::test]
    async fn upload_without_api_endpoint_fails() {
        let server = MockServer::start();
        let client = gateway_client(&server, false);
        assert!(client.upload(b"data".to_vec()).await.is_err());
    }

    #[test]
    fn sample_selection_is_deterministic() {
        let first = sample_input("QmSomeInputHash");
        let second = sample_input("QmSomeInputHash");
        assert_eq!(first, second);
        assert!(SAMPLE_INPUTS.contains(&first));
    }

    #[tokio::test]
    async fn resolver_falls_back_to_sample_corpus() {
        let mut store = MockContentStore::new();
        store.expect_fetch().returning(|_| Err(eyre!("gateway unreachable")));

        let payloads = PayloadStore::new(Arc::new(store));
        let payload = payloads.resolve("QmUnreachable").await;
        assert_eq!(payload, sample_input("QmUnreachable"));
    }

    #[tokio::test]
    async fn resolver_caches_fetched_payloads() {
        let mut store = MockContentStore::new();
        store.expect_fetch().times(1).returning(|_| Ok(b"cached payload".to_vec()));

        let payloads = PayloadStore::new(Arc::new(store));
        assert_eq!(payloads.resolve("QmCached").await, "cached payload");
        // Second resolve must not hit the store again.
        assert_eq!(payloads.resolve("QmCached").await, "cached payload");
    }

    #[tokio::test]
    async fn failed_result_upload_degrades_to_digest() {
        let mut store = MockContentStore::new();
        store.expect_upload().returning(|_| Err(eyre!("api down")));

        let payloads = PayloadStore::new(Arc::new(store));
        let hash = payloads.store_result(b"result").await;
        assert_eq!(hash, keccak256(b"result").to_string());
    }
}
