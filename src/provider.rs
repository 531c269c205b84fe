//! Provider-Fetch Collaborator
//!
//! The only path by which the cache core reaches external book-data
//! providers. Timeouts and retries against upstream belong to the provider
//! implementation, not to the cache.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::cache::entry::{CacheKey, Category, Page};
use crate::error::{Error, Result};

/// Query parameters derived from a cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParams {
    pub category: Category,
    pub query: String,
    pub page: Option<Page>,
}

impl FetchParams {
    pub fn from_key(key: &CacheKey) -> Self {
        Self {
            category: key.category(),
            query: key.query().to_string(),
            page: key.page().cloned(),
        }
    }

    /// The cache key these parameters resolve to
    pub fn cache_key(&self) -> CacheKey {
        match &self.page {
            Some(page) => CacheKey::paged(self.category, &self.query, page.clone()),
            None => CacheKey::new(self.category, &self.query),
        }
    }
}

/// Provider result. `success == false` means the provider chain failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub payload: Value,
    pub success: bool,
}

impl ProviderResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            payload: Value::Null,
            success: false,
        }
    }
}

/// Provider-fetch function
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch(&self, params: &FetchParams) -> Result<ProviderResponse>;
}

// =============================================================================
// HTTP Provider
// =============================================================================

/// HTTP provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// Enrichment API base URL
    pub base_url: String,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Provider calling the enrichment API over HTTP
///
/// `GET {base}/v1/{category}?q=..[&offset=..&limit=..&sort=..]`. Bodies of the
/// form `{"success": bool, "data": ...}` are unwrapped; any other JSON body is
/// the payload.
pub struct HttpProvider {
    config: HttpProviderConfig,
    client: Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("tomecache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Request URL for a fetch
    pub fn url_for(&self, params: &FetchParams) -> String {
        let mut url = format!(
            "{}/v1/{}?q={}",
            self.config.base_url.trim_end_matches('/'),
            params.category,
            urlencoding::encode(&params.query)
        );
        if let Some(page) = &params.page {
            url.push_str(&format!(
                "&offset={}&limit={}&sort={}",
                page.offset,
                page.limit,
                urlencoding::encode(&page.sort)
            ));
        }
        url
    }
}

#[async_trait]
impl Provider for HttpProvider {
    #[instrument(skip(self), fields(category = %params.category, query = %params.query))]
    async fn fetch(&self, params: &FetchParams) -> Result<ProviderResponse> {
        let url = self.url_for(params);
        let failure = |reason: String| Error::ProviderFailure {
            key: params.cache_key().render(),
            reason,
        };

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("upstream returned {}", status)));
        }

        let body: Value = response.json().await?;
        debug!(%status, "Provider responded");

        Ok(unwrap_envelope(body))
    }
}

fn unwrap_envelope(body: Value) -> ProviderResponse {
    match body {
        Value::Object(mut map) if map.contains_key("success") && map.contains_key("data") => {
            let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
            ProviderResponse {
                payload: map.remove("data").unwrap_or(Value::Null),
                success,
            }
        }
        other => ProviderResponse::ok(other),
    }
}

// =============================================================================
// In-Memory Provider
// =============================================================================

#[cfg(any(test, feature = "test-util"))]
pub use fixture::InMemoryProvider;

#[cfg(any(test, feature = "test-util"))]
mod fixture {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use dashmap::{DashMap, DashSet};
    use serde_json::Value;

    use super::{FetchParams, Provider, ProviderResponse};
    use crate::cache::entry::CacheKey;
    use crate::error::Result;

    /// Fixture-backed provider keyed by rendered cache key
    ///
    /// Unknown keys resolve successfully with a null payload (no results).
    /// Available to downstream tests through the `test-util` feature.
    #[derive(Default)]
    pub struct InMemoryProvider {
        responses: DashMap<String, Value>,
        failing: DashSet<String>,
        calls: DashMap<String, u64>,
        total_calls: AtomicU64,
        latency: Duration,
    }

    impl InMemoryProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulated upstream latency per call
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn insert(&self, key: &CacheKey, payload: Value) {
            self.responses.insert(key.render(), payload);
        }

        /// Make every fetch for `key` report failure
        pub fn fail(&self, key: &CacheKey) {
            self.failing.insert(key.render());
        }

        pub fn recover(&self, key: &CacheKey) {
            self.failing.remove(&key.render());
        }

        pub fn calls_for(&self, key: &CacheKey) -> u64 {
            self.calls.get(&key.render()).map(|c| *c).unwrap_or(0)
        }

        pub fn total_calls(&self) -> u64 {
            self.total_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for InMemoryProvider {
        async fn fetch(&self, params: &FetchParams) -> Result<ProviderResponse> {
            let key = params.cache_key().render();
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            *self.calls.entry(key.clone()).or_insert(0) += 1;

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            if self.failing.contains(&key) {
                return Ok(ProviderResponse::failed());
            }

            Ok(ProviderResponse::ok(
                self.responses
                    .get(&key)
                    .map(|p| p.value().clone())
                    .unwrap_or(Value::Null),
            ))
        }
    }
}
