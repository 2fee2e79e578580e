//! Raw payload archive, HTTP fetch, freshness cache and entity persistence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metamorph_core::Source;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod cache;
mod entity_store;

pub use cache::{CacheError, CacheLookup, CacheOutcome, FreshnessCache, RawCacheRecord};
pub use entity_store::{EntityStore, MemoryEntityStore, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "metamorph-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compact JSON rendering with object keys sorted at every level.
pub fn canonical_json(value: &JsonValue) -> String {
    fn sorted(value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                JsonValue::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

pub fn payload_hash(payload: &JsonValue) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Where a raw payload landed in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPayload {
    pub content_hash: String,
    /// Path below the archive root: `<stamp>/<source>/<hash>.json`.
    pub relative_path: PathBuf,
    pub bytes: usize,
    /// An identical payload was already archived under the same path.
    pub reused: bool,
}

/// Content-addressed archive of raw source payloads. Entries are written
/// once and never modified.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        source: Source,
        content_hash: &str,
    ) -> PathBuf {
        Path::new(&fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source.as_str())
            .join(content_hash)
            .with_extension("json")
    }

    pub async fn archive(
        &self,
        source: Source,
        fetched_at: DateTime<Utc>,
        payload: &JsonValue,
    ) -> anyhow::Result<ArchivedPayload> {
        let body = canonical_json(payload).into_bytes();
        let content_hash = sha256_hex(&body);
        let relative_path = Self::relative_path_for(fetched_at, source, &content_hash);
        let target = self.root.join(&relative_path);
        let reused = write_once(&target, &body).await?;
        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            bytes: body.len(),
            reused,
        })
    }
}

/// Write `body` to `target` through a temp file and rename. Returns `true`
/// when `target` already existed and nothing was written.
async fn write_once(target: &Path, body: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("archive path {} has no parent", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;
    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking {}", target.display()))?
    {
        return Ok(true);
    }

    let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp)
        .await
        .with_context(|| format!("opening {}", temp.display()))?;
    file.write_all(body)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp.display()))?;
    drop(file);

    match fs::rename(&temp, target).await {
        Ok(()) => Ok(false),
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(true);
            }
            Err(err).with_context(|| format!("renaming {} -> {}", temp.display(), target.display()))
        }
    }
}

/// Statuses worth another attempt: upstream trouble and throttling.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), doubling each time.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url` and decode the body as JSON, retrying transient failures.
    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        source: Source,
        url: &str,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", %run_id, %source, url);
        async {
            let _permit = self
                .global_limit
                .acquire()
                .await
                .map_err(|_| FetchError::LimiterClosed)?;
            let body = self.get_with_retries(url).await?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    async fn get_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let last_try = attempt >= self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes().await?.to_vec()),
                Ok(resp) => {
                    let status = resp.status();
                    if last_try || !is_transient_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying after http status");
                }
                Err(err) => {
                    if last_try || !is_transient_error(&err) {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying after request error");
                }
            }
            tokio::time::sleep(self.backoff.delay(attempt)).await;
            attempt += 1;
        }
    }
}
