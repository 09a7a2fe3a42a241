//! Search-source contracts: the scraper-worker capability the batch
//! orchestrator drives, plus HTTP-worker and fixture-backed implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pricewatch_core::{Platform, RawProduct};
use pricewatch_storage::{keyword_slug, RetryDisposition};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "pricewatch-adapters";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    /// Timeouts, rate limiting, 5xx: worth another attempt.
    #[error("transient search failure: {0}")]
    Transient(String),
    #[error("search failed: {0}")]
    Permanent(String),
}

impl SearchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SearchError::Transient(_) => RetryDisposition::Retryable,
            SearchError::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// `search(keyword, platform, limit)` as offered by an independent scraper worker.
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn search(
        &self,
        keyword: &str,
        platform: Platform,
        limit: usize,
    ) -> Result<Vec<RawProduct>, SearchError>;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn search_error(disposition: RetryDisposition, message: String) -> SearchError {
    match disposition {
        RetryDisposition::Retryable => SearchError::Transient(message),
        RetryDisposition::NonRetryable => SearchError::Permanent(message),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub platform: Platform,
    pub endpoint: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// `workers.yaml`: which scraper worker serves which platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistry {
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl WorkerRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing worker registry")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn endpoints(&self) -> BTreeMap<Platform, String> {
        self.workers
            .iter()
            .filter(|w| w.enabled)
            .map(|w| (w.platform, w.endpoint.trim_end_matches('/').to_string()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("pricewatch/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    products: Vec<serde_json::Value>,
}

/// Decode products one by one; malformed entries are logged and dropped so
/// the rest of the response survives.
pub fn decode_products(items: Vec<serde_json::Value>, origin: &str) -> Vec<RawProduct> {
    let total = items.len();
    let products: Vec<RawProduct> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value(item) {
            Ok(product) => Some(product),
            Err(err) => {
                warn!(origin, index, error = %err, "dropping malformed raw product");
                None
            }
        })
        .collect();
    if products.len() < total {
        warn!(origin, dropped = total - products.len(), kept = products.len(), "search result had malformed products");
    }
    products
}

/// Calls `GET {endpoint}/search?keyword=..&limit=..` on the worker for a platform.
#[derive(Debug, Clone)]
pub struct HttpWorkerSource {
    client: reqwest::Client,
    endpoints: BTreeMap<Platform, String>,
}

impl HttpWorkerSource {
    pub fn new(registry: &WorkerRegistry, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoints: registry.endpoints(),
        })
    }
}

#[async_trait]
impl SearchSource for HttpWorkerSource {
    async fn search(
        &self,
        keyword: &str,
        platform: Platform,
        limit: usize,
    ) -> Result<Vec<RawProduct>, SearchError> {
        let endpoint = self.endpoints.get(&platform).ok_or_else(|| {
            SearchError::Permanent(format!("no scraper worker configured for {platform}"))
        })?;
        let url = format!("{endpoint}/search");
        let span = info_span!("worker_search", %platform, keyword, url = %url);

        async move {
            let resp = self
                .client
                .get(&url)
                .query(&[("keyword", keyword.to_string()), ("limit", limit.to_string())])
                .send()
                .await
                .map_err(|err| search_error(classify_reqwest_error(&err), err.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(search_error(
                    classify_status(status),
                    format!("http status {} from {url}", status.as_u16()),
                ));
            }

            let body: WorkerResponse = resp.json().await.map_err(|err| {
                SearchError::Permanent(format!("malformed worker response from {url}: {err}"))
            })?;

            let mut products = decode_products(body.products, &url);
            if let Some(stray) = products.iter().find(|p| p.platform != platform) {
                return Err(SearchError::Permanent(format!(
                    "worker for {platform} returned a {} product",
                    stray.platform
                )));
            }

            products.truncate(limit);
            debug!(count = products.len(), "worker search finished");
            Ok(products)
        }
        .instrument(span)
        .await
    }
}

/// Canned results at `{root}/{platform}/{keyword-slug}.json`, for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, keyword: &str, platform: Platform) -> PathBuf {
        self.root
            .join(platform.as_str())
            .join(format!("{}.json", keyword_slug(keyword)))
    }
}

#[async_trait]
impl SearchSource for FixtureSource {
    async fn search(
        &self,
        keyword: &str,
        platform: Platform,
        limit: usize,
    ) -> Result<Vec<RawProduct>, SearchError> {
        let path = self.fixture_path(keyword, platform);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(SearchError::Transient(format!(
                    "reading fixture {}: {err}",
                    path.display()
                )))
            }
        };
        let items: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(|err| {
            SearchError::Permanent(format!("parsing fixture {}: {err}", path.display()))
        })?;
        let mut products = decode_products(items, &path.display().to_string());
        products.retain(|p| p.platform == platform);
        products.truncate(limit);
        Ok(products)
    }
}
