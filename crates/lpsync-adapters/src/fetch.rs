//! Listing-page downloads with bounded concurrency and backoff on transient failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Delay before retry `n` is `base_delay * 2^n`, never more than `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Pages in flight across all hosts.
    pub global_concurrency: usize,
    /// Pages in flight against any single legacy host.
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            per_host_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    /// Decoded with the charset the server declared.
    pub body: String,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// 5xx, 429 and transport-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .is_ok_and(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS),
            Self::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Client(_) | Self::InvalidUrl { .. } | Self::Closed => false,
        }
    }
}

/// Concurrency key for a URL; pages on the same host share a permit pool.
pub fn host_key(url: &str) -> Result<String, FetchError> {
    let invalid = |message: String| FetchError::InvalidUrl {
        url: url.to_string(),
        message,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("missing host".to_string()))?
        .to_ascii_lowercase();
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

#[derive(Debug)]
struct HostPermits {
    limit: usize,
    pools: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostPermits {
    fn pool(&self, host: &str) -> Arc<Semaphore> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            pools
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
        )
    }
}

/// One per run, shared by every listing page of the source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Semaphore,
    hosts: HostPermits,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().map_err(FetchError::Client)?,
            global: Semaphore::new(config.global_concurrency.max(1)),
            hosts: HostPermits {
                limit: config.per_host_concurrency.max(1),
                pools: Mutex::new(HashMap::new()),
            },
            backoff: config.backoff,
        })
    }

    /// GETs one listing page. Transient failures are retried per the backoff
    /// policy while the page's permits stay held.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let host = host_key(url)?;
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let host_pool = self.hosts.pool(&host);
        let _host = host_pool.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, host = %host, url);
        async {
            let mut retry = 0;
            loop {
                match self.attempt(url, retry + 1).await {
                    Ok(page) => return Ok(page),
                    Err(err) if err.is_transient() && retry < self.backoff.max_retries => {
                        let delay = self.backoff.delay(retry);
                        warn!(retry, ?delay, error = %err, "listing fetch failed, retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str, attempts: usize) -> Result<FetchedPage, FetchError> {
        let request_failed = |url: &str, source| FetchError::Request {
            url: url.to_string(),
            attempts,
            source,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_failed(url, e))?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        // Older CMS pages are often EUC-KR; `text` honors the declared charset.
        let body = response
            .text()
            .await
            .map_err(|e| request_failed(&final_url, e))?;
        debug!(status = status.as_u16(), bytes = body.len(), attempts, "listing page fetched");
        Ok(FetchedPage {
            final_url,
            body,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let delays: Vec<_> = (0..4).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(policy.delay(usize::MAX), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_transient() {
        let status = |status: u16| FetchError::HttpStatus {
            status,
            url: "https://legacy.example.org/programs".into(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!FetchError::Closed.is_transient());
    }

    #[test]
    fn host_key_groups_pages_by_host_and_port() {
        assert_eq!(
            host_key("https://Legacy.Example.org/programs?page=2").unwrap(),
            "legacy.example.org"
        );
        assert_eq!(host_key("http://127.0.0.1:8080/list").unwrap(), "127.0.0.1:8080");
        assert!(matches!(
            host_key("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn pages_on_one_host_share_a_pool() {
        let permits = HostPermits {
            limit: 1,
            pools: Mutex::new(HashMap::new()),
        };
        let a = permits.pool("legacy.example.org");
        let b = permits.pool("legacy.example.org");
        let c = permits.pool("archive.example.org");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.available_permits(), 1);
    }
}
