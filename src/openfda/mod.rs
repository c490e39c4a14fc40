use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{OpenFda, MAX_PAGE_SIZE};
use crate::cursor::Cursor;
use crate::error::FetchError;
use crate::model::{RawPage, RecordKind};
use crate::openfda::model::{ErrorResponse, SearchResponse};
use crate::rate_limit::RateLimiter;

pub mod model;

/// Open upper bound for date range searches.
const DATE_RANGE_END: &str = "99991231";
const MAX_LOGGED_BODY: usize = 300;
/// Largest `skip` openFDA accepts; past it every query is a 400.
pub const MAX_SKIP: u64 = 25_000;

/// Source of raw pages for the orchestrator.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: &Cursor,
        page_size: u32,
    ) -> Result<RawPage, FetchError>;
}

/// Exponential backoff with equal jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &OpenFda) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base: Duration::from_millis(settings.backoff_base_ms),
            cap: Duration::from_secs(settings.backoff_cap_secs),
        }
    }

    /// Longest wait after failed attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Wait after failed attempt `attempt`: half of the ceiling is fixed, the
    /// other half is random.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (ceiling - half) + jitter
    }
}

/// openFDA HTTP client: one GET per attempt, throttled and retried.
pub struct OpenFdaClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    retry: RetryPolicy,
    limiter: RateLimiter,
}

impl fmt::Debug for OpenFdaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFdaClient")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .field("retry", &self.retry)
            .field("requests_per_minute", &self.limiter.limit())
            .finish_non_exhaustive()
    }
}

enum AttemptError {
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    Fatal(FetchError),
}

impl OpenFdaClient {
    pub fn new(
        base_url: Url,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
        limiter: RateLimiter,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("fda-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            retry,
            limiter,
        })
    }

    pub fn from_settings(settings: &OpenFda, api_key: Option<&str>) -> Result<Self, FetchError> {
        let base_url = parse_base_url(&settings.base_url)?;
        let api_key = api_key.map(str::to_string);
        let limiter = RateLimiter::per_minute(settings.requests_per_minute(api_key.is_some()));
        Self::new(
            base_url,
            api_key,
            Duration::from_secs(settings.timeout_secs),
            RetryPolicy::from_settings(settings),
            limiter,
        )
        .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {}", e)))
    }

    /// Query pairs for one page, without the API key.
    pub fn query_params(kind: RecordKind, cursor: &Cursor, page_size: u32) -> Vec<(String, String)> {
        let field = kind.date_field();
        vec![
            (
                "search".to_string(),
                format!("{}:[{} TO {}]", field, cursor.api_date(), DATE_RANGE_END),
            ),
            ("sort".to_string(), format!("{}:asc", field)),
            ("limit".to_string(), page_size.to_string()),
            ("skip".to_string(), cursor.skip().to_string()),
        ]
    }

    pub fn build_request(
        &self,
        kind: RecordKind,
        cursor: &Cursor,
        page_size: u32,
    ) -> Result<reqwest::Request, FetchError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(FetchError::InvalidRequest(format!(
                "page_size {} outside 1..={}",
                page_size, MAX_PAGE_SIZE
            )));
        }
        if cursor.skip() > MAX_SKIP {
            return Err(FetchError::SkipLimit {
                cursor: cursor.clone(),
                limit: MAX_SKIP,
            });
        }
        let endpoint = self
            .base_url
            .join(kind.endpoint())
            .map_err(|e| FetchError::InvalidRequest(format!("invalid endpoint URL: {}", e)))?;
        let mut builder = self
            .http
            .get(endpoint)
            .query(&Self::query_params(kind, cursor, page_size));
        if let Some(key) = &self.api_key {
            builder = builder.query(&[("api_key", key)]);
        }
        builder
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("failed to build request: {}", e)))
    }

    async fn attempt(
        &self,
        kind: RecordKind,
        cursor: &Cursor,
        page_size: u32,
    ) -> Result<RawPage, AttemptError> {
        let request = self
            .build_request(kind, cursor, page_size)
            .map_err(AttemptError::Fatal)?;
        let params = Self::query_params(kind, cursor, page_size);
        debug!(path = request.url().path(), ?params, "openFDA request");

        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(e) if e.is_builder() => {
                return Err(AttemptError::Fatal(FetchError::InvalidRequest(e.to_string())))
            }
            Err(e) => {
                return Err(AttemptError::Retry {
                    reason: format!("request failed: {}", e),
                    retry_after: None,
                })
            }
        };

        let status = res.status();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = res.text().await.map_err(|e| AttemptError::Retry {
            reason: format!("failed to read response body: {}", e),
            retry_after: None,
        })?;

        if status.is_success() {
            let envelope: SearchResponse =
                serde_json::from_str(&body).map_err(|e| AttemptError::Retry {
                    reason: format!("invalid openFDA response JSON: {}", e),
                    retry_after: None,
                })?;
            let total = envelope.total();
            let has_more = envelope.results.len() >= page_size as usize;
            return Ok(RawPage {
                records: envelope.results,
                has_more,
                fetch_params: params,
                total,
                fetched_at: Utc::now(),
            });
        }

        let no_matches = status == StatusCode::NOT_FOUND
            && serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.is_no_matches())
                .unwrap_or(false);
        if no_matches {
            debug!("no records past cursor");
            return Ok(RawPage {
                records: Vec::new(),
                has_more: false,
                fetch_params: params,
                total: Some(0),
                fetched_at: Utc::now(),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptError::Retry {
                reason: format!("HTTP {}: {}", status.as_u16(), truncate(&body)),
                retry_after,
            });
        }

        Err(AttemptError::Fatal(FetchError::Permanent {
            status: status.as_u16(),
            body,
        }))
    }
}

#[async_trait]
impl PageFetcher for OpenFdaClient {
    #[instrument(skip_all, fields(record_kind = %kind, cursor = %cursor))]
    async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: &Cursor,
        page_size: u32,
    ) -> Result<RawPage, FetchError> {
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            self.limiter.acquire().await;
            match self.attempt(kind, cursor, page_size).await {
                Ok(page) => {
                    info!(
                        records = page.records.len(),
                        has_more = page.has_more,
                        total = ?page.total,
                        attempts = attempt + 1,
                        "fetched page"
                    );
                    return Ok(page);
                }
                Err(AttemptError::Fatal(err)) => {
                    warn!(%err, "openFDA request failed permanently");
                    return Err(err);
                }
                Err(AttemptError::Retry {
                    reason,
                    retry_after,
                }) => {
                    last_error = reason;
                    if attempt + 1 >= self.retry.max_attempts {
                        break;
                    }
                    let wait = retry_after
                        .map(|d| d.min(self.retry.cap))
                        .unwrap_or_else(|| self.retry.delay(attempt));
                    warn!(
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %last_error,
                        "retrying openFDA request after backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Err(FetchError::Transient {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, FetchError> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| FetchError::InvalidRequest(format!("invalid base URL '{}': {}", raw, e)))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_LOGGED_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
