//! Rate-limited, retrying HTTP client for the upstream catalog.
//!
//! One `BookFetcher` instance owns the connection pool and a single token
//! bucket; every outgoing request, from any task, consumes a token first.
//! Retries use exponential backoff (`delay * 2^attempt`) and respect the
//! shared cancellation flag between attempts.

mod parse;

pub use parse::{parse_book_page, parse_catalog_page};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::Book;

const USER_AGENT: &str = "bookwatch/0.1 (catalog mirror)";

/// The largest page index the pagecount probe will consider.
const MAX_PROBE_PAGE: u32 = 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Terminal 404: the resource is gone upstream. Never retried.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("retries exhausted for {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to parse page at {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    /// Transport-level trouble (refused connections, timeouts, an exhausted
    /// retry budget) that warrants backing off before hitting the site
    /// again. Terminal and content errors are not connection-class.
    pub fn is_connection_class(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_connect() || e.is_timeout(),
            FetchError::RetriesExhausted { .. } => true,
            FetchError::NotFound(_) | FetchError::Cancelled | FetchError::Parse { .. } => false,
        }
    }
}

/// Cooperative cancellation shared between a reconciliation run and its
/// in-flight fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Token bucket request pacer. Callers block until a token is available;
/// the bucket is held locked while waiting, so concurrent callers serialize
/// at the rate boundary.
pub struct RatePacer {
    rate_per_second: f64,
    state: Mutex<PacerState>,
}

struct PacerState {
    tokens: f64,
    last_refill: Instant,
}

impl RatePacer {
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            rate_per_second,
            state: Mutex::new(PacerState {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token, waiting for the refill when the bucket is empty.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(1.0);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return;
        }

        let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_second);
        debug!(wait_ms = wait.as_millis() as u64, "rate pacer waiting");
        sleep(wait).await;
        state.tokens = 0.0;
        state.last_refill = Instant::now();
    }
}

/// Seam between the detection pipeline and the live site. Tests substitute
/// an in-memory implementation.
#[async_trait]
pub trait BookSource: Send + Sync {
    /// Fetch and parse one book detail page.
    async fn fetch_book(&self, url: &str) -> Result<Book, FetchError>;

    /// Book URLs listed on catalog page `n`; empty when the page is absent.
    async fn fetch_catalog_page(&self, page: u32) -> Result<Vec<String>, FetchError>;

    /// Index of the last populated catalog page.
    async fn count_pages(&self) -> Result<u32, FetchError>;
}

pub struct BookFetcher {
    client: reqwest::Client,
    pacer: RatePacer,
    base_url: String,
    retry_attempts: u32,
    retry_delay: Duration,
    cancel: CancelToken,
}

impl BookFetcher {
    pub fn new(config: &Config, cancel: CancelToken) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(config.max_concurrent_requests)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            pacer: RatePacer::new(config.rate_limit_per_second),
            base_url: config.base_url.clone(),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_secs_f64(config.retry_delay_secs),
            cancel,
        })
    }

    fn page_url(&self, page: u32) -> String {
        format!("{}/catalogue/page-{}.html", self.base_url, page)
    }

    /// GET with pacing and exponential backoff. 2xx returns the body; 404 is
    /// terminal; everything else retries until the attempt budget runs out.
    async fn get_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut last_error = String::new();

        for attempt in 0..=self.retry_attempts {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.pacer.acquire().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound(url.to_string()));
                    }
                    last_error = format!("status {status}");
                    warn!(url, %status, attempt, "unexpected status");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(url, error = %e, attempt, "request failed");
                }
            }

            if attempt < self.retry_attempts {
                let delay = self.retry_delay * 2u32.pow(attempt);
                debug!(url, delay_ms = delay.as_millis() as u64, "retrying");
                sleep(delay).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: self.retry_attempts + 1,
            last_error,
        })
    }

    async fn page_has_books(&self, page: u32) -> Result<bool, FetchError> {
        // Absent pages already surface as an empty URL list.
        Ok(!self.fetch_catalog_page(page).await?.is_empty())
    }
}

#[async_trait]
impl BookSource for BookFetcher {
    async fn fetch_book(&self, url: &str) -> Result<Book, FetchError> {
        let body = self.get_with_retry(url).await?;
        parse_book_page(&body, url)
    }

    async fn fetch_catalog_page(&self, page: u32) -> Result<Vec<String>, FetchError> {
        let url = self.page_url(page);
        match self.get_with_retry(&url).await {
            Ok(body) => parse_catalog_page(&body, &url),
            Err(FetchError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Exponentially probe 1, 2, 4, 8, … until an empty page brackets the
    /// catalog end, then binary-search the bracket for the last populated
    /// page. The root page is checked first: no `next` control means a
    /// single page.
    async fn count_pages(&self) -> Result<u32, FetchError> {
        let root = self.get_with_retry(&self.base_url).await?;
        if !parse::has_next_control(&root) {
            return Ok(1);
        }

        // Bracket: `low` is a known-populated page, `high` known-empty.
        let mut low = 1u32;
        let mut high = 2u32;
        loop {
            if high > MAX_PROBE_PAGE {
                high = MAX_PROBE_PAGE + 1;
                break;
            }
            if self.page_has_books(high).await? {
                low = high;
                high *= 2;
            } else {
                break;
            }
        }

        while low + 1 < high {
            let mid = low + (high - low) / 2;
            if self.page_has_books(mid).await? {
                low = mid;
            } else {
                high = mid;
            }
        }

        Ok(low)
    }
}
