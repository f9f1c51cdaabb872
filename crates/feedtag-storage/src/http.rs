//! Paced HTTP client with retry and backoff, shared by network collaborators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("feedtag/", env!("CARGO_PKG_VERSION")).to_string()),
            concurrency: 1,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Upper bound on requests started per minute, enforced by even spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_per_minute: u32,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_minute(requests_per_minute: u32) -> Option<Self> {
        (requests_per_minute > 0).then_some(Self {
            requests_per_minute,
        })
    }

    pub fn spacing(&self) -> Duration {
        Duration::from_secs(60) / self.requests_per_minute.max(1)
    }
}

/// Hands out start slots at least `spacing` apart. Waiters queue in arrival order.
#[derive(Debug)]
struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            spacing: limit.spacing(),
            next_slot: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.spacing);
            slot
        };
        if slot > Instant::now() {
            debug!(wait_ms = (slot - Instant::now()).as_millis() as u64, "pacing http request");
            tokio::time::sleep_until(slot).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client closed")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
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
        let pacer = config.rate_limit.map(RequestPacer::new);

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            pacer,
            backoff: config.backoff,
        })
    }

    /// POST a JSON body and return the response bytes, retrying retryable statuses and
    /// transport errors with backoff.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(pacer) = &self.pacer {
            pacer.wait_turn().await;
        }

        let span = info_span!("http_post", url);
        self.post_with_retries(url, bearer, body).instrument(span).await
    }

    async fn post_with_retries<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let can_retry = attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying http post");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %format!("{err:#}"), attempt, "retrying http post");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
