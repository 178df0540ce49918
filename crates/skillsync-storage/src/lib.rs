//! Persistence, worker pool and HTTP fetch utilities for SkillSync.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod ledger;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod store;

pub use ledger::{canonical_url, conflict_key, IngestionLedger};
pub use memory::MemoryStore;
pub use pool::{spawn_collector, PoolError, ResultStream, TaskResult, WorkerPool};
pub use postgres::PgStore;
pub use store::{
    JobQuery, MatchStore, PostingStore, RequirementStore, RunStore, SkillCatalog, StatusQuery,
    Store, StoreError, StoreHandles, StoreResult, UserQuery,
};

pub const CRATE_NAME: &str = "skillsync-storage";

/// Response bodies above this size are rejected rather than truncated.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear backoff: the n-th retry waits `step * n`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_millis(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index.saturating_add(1)).unwrap_or(u32::MAX);
        self.step.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
}

/// GET client shared by the crawlers of one run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    max_body_bytes: usize,
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
            backoff: BackoffPolicy {
                max_attempts: config.backoff.max_attempts.max(1),
                step: config.backoff.step,
            },
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                sent = self.client.get(url).send() => sent,
            };
            let retries_left = attempt + 1 < self.backoff.max_attempts;

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = read_limited(resp, &final_url, self.max_body_bytes, cancel)
                            .await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        debug!(url, status = status.as_u16(), attempt, "retrying http fetch");
                        self.pause(attempt, cancel).await?;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        debug!(url, error = %err, attempt, "retrying http fetch");
                        self.pause(attempt, cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_text(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(url, cancel).await?.text())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url, cancel).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }

    async fn pause(&self, attempt: usize, cancel: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.backoff.delay_for_attempt(attempt)) => Ok(()),
        }
    }
}

async fn read_limited(
    mut resp: reqwest::Response,
    url: &str,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError> {
    let too_large = || FetchError::BodyTooLarge {
        url: url.to_string(),
        limit,
    };
    if let Some(len) = resp.content_length() {
        if usize::try_from(len).map_or(true, |len| len > limit) {
            return Err(too_large());
        }
    }

    let mut body = Vec::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            chunk = resp.chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            return Ok(body);
        };
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
}
