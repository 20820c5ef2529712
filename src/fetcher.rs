//! Rate-limit aware retry and sequential pagination for upstream listings.
//!
//! Every listing call in the service goes through [`PagedFetcher`], which
//! wraps each page request in [`retry_on_rate_limit`]. Only rate-limit
//! failures are retried; anything else propagates on the first attempt.

use async_trait::async_trait;
use rand::Rng;
use std::{env, fmt::Display, future::Future, sync::Arc};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

/// Errors that can tell whether they represent an HTTP 429-equivalent.
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

/// Sleep seam so backoff behaviour can be observed without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the random jitter, as a fraction of the computed delay.
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env::var("RATE_LIMIT_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
            base_delay: env::var("RATE_LIMIT_BASE_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            ..defaults
        }
    }

    /// `base × 2^attempt`, stretched by up to `max_jitter`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter > 0.0 {
            rand::rng().random_range(0.0..=self.max_jitter)
        } else {
            0.0
        };
        exp.mul_f64(1.0 + jitter)
    }
}

/// Run `op`, retrying only rate-limited failures with exponential backoff.
pub async fn retry_on_rate_limit<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitSignal + Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limited() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                warn!(
                    target = "oc.fetcher",
                    call = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate_limited_backing_off"
                );
                crate::metrics::rate_limited(label);
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: usize,
    pub first_page: u32,
    pub max_pages: u32,
    pub inter_page_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            first_page: 1,
            max_pages: 50,
            inter_page_delay: Duration::from_millis(350),
            retry: RetryPolicy::default(),
        }
    }
}

impl PagingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env::var("PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.page_size),
            max_pages: env::var("MAX_PAGES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_pages),
            inter_page_delay: env::var("PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.inter_page_delay),
            retry: RetryPolicy::from_env(),
            ..defaults
        }
    }
}

/// Everything a drained fetcher produced.
#[derive(Debug)]
pub struct Listing<T> {
    pub records: Vec<T>,
    pub pages: u32,
    /// The page bound was reached while pages were still full.
    pub truncated: bool,
}

/// Sequential page walker. Page N+1 is requested only after page N returned.
/// Once exhausted it stays exhausted.
pub struct PagedFetcher<F> {
    fetch: F,
    config: PagingConfig,
    sleeper: Arc<dyn Sleeper>,
    label: String,
    next_page: u32,
    pages_fetched: u32,
    finished: bool,
    truncated: bool,
}

impl<F, Fut, T, E> PagedFetcher<F>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
    E: RateLimitSignal + Display,
{
    pub fn with_sleeper(
        label: impl Into<String>,
        config: PagingConfig,
        sleeper: Arc<dyn Sleeper>,
        fetch: F,
    ) -> Self {
        let next_page = config.first_page;
        Self {
            fetch,
            config,
            sleeper,
            label: label.into(),
            next_page,
            pages_fetched: 0,
            finished: false,
            truncated: false,
        }
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, E> {
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.config.max_pages {
            self.finished = true;
            self.truncated = true;
            warn!(
                target = "oc.fetcher",
                call = %self.label,
                pages = self.pages_fetched,
                "listing_truncated"
            );
            return Ok(None);
        }
        if self.pages_fetched > 0 && !self.config.inter_page_delay.is_zero() {
            self.sleeper.sleep(self.config.inter_page_delay).await;
        }

        let page = self.next_page;
        let fetch = &mut self.fetch;
        let result = retry_on_rate_limit(
            &self.config.retry,
            self.sleeper.as_ref(),
            &self.label,
            || fetch(page),
        )
        .await;
        let records = match result {
            Ok(records) => records,
            Err(err) => {
                self.finished = true;
                return Err(err);
            }
        };

        self.pages_fetched += 1;
        self.next_page += 1;
        debug!(
            target = "oc.fetcher",
            call = %self.label,
            page,
            records = records.len(),
            "page_fetched"
        );
        if records.len() < self.config.page_size {
            self.finished = true;
        }
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Listing<T>, E> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(Listing {
            records,
            pages: self.pages_fetched,
            truncated: self.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSleeper;
    use std::sync::Mutex;

    #[derive(Debug)]
    enum FakeError {
        RateLimited,
        Broken,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RateLimitSignal for FakeError {
        fn is_rate_limited(&self) -> bool {
            matches!(self, FakeError::RateLimited)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_jitter: 0.25,
        }
    }

    #[tokio::test]
    async fn three_rate_limits_then_success() {
        let sleeper = RecordingSleeper::default();
        let calls = Mutex::new(0u32);
        let result = retry_on_rate_limit(&fast_policy(), &sleeper, "test", || {
            let mut guard = calls.lock().unwrap();
            *guard += 1;
            let n = *guard;
            async move {
                if n <= 3 {
                    Err(FakeError::RateLimited)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        let slept = sleeper.recorded();
        assert_eq!(slept.len(), 3);
        assert!(slept.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(slept[0] >= Duration::from_millis(10));
        assert!(slept[2] <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn fourth_rate_limit_propagates() {
        let sleeper = RecordingSleeper::default();
        let result: Result<(), FakeError> =
            retry_on_rate_limit(&fast_policy(), &sleeper, "test", || async {
                Err(FakeError::RateLimited)
            })
            .await;
        assert!(matches!(result, Err(FakeError::RateLimited)));
        assert_eq!(sleeper.recorded().len(), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let calls = Mutex::new(0u32);
        let result: Result<(), FakeError> =
            retry_on_rate_limit(&fast_policy(), &sleeper, "test", || {
                *calls.lock().unwrap() += 1;
                async { Err(FakeError::Broken) }
            })
            .await;
        assert!(matches!(result, Err(FakeError::Broken)));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(sleeper.recorded().is_empty());
    }

    fn paging(page_size: usize, max_pages: u32) -> PagingConfig {
        PagingConfig {
            page_size,
            first_page: 1,
            max_pages,
            inter_page_delay: Duration::from_millis(5),
            retry: fast_policy(),
        }
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let requested = Arc::new(Mutex::new(Vec::new()));
        let seen = requested.clone();
        let fetcher =
            PagedFetcher::with_sleeper("pages", paging(2, 10), sleeper.clone(), move |page| {
                seen.lock().unwrap().push(page);
                async move {
                    let rows = match page {
                        1 => vec![1, 2],
                        2 => vec![3, 4],
                        _ => vec![5],
                    };
                    Ok::<_, FakeError>(rows)
                }
            });
        let listing = fetcher.collect_all().await.unwrap();
        assert_eq!(listing.records, vec![1, 2, 3, 4, 5]);
        assert!(!listing.truncated);
        assert_eq!(*requested.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(sleeper.recorded(), vec![Duration::from_millis(5); 2]);
    }

    #[tokio::test]
    async fn empty_page_ends_stream() {
        let fetcher = PagedFetcher::with_sleeper(
            "pages",
            paging(2, 10),
            Arc::new(RecordingSleeper::default()),
            |page| async move {
                Ok::<Vec<u32>, FakeError>(if page == 1 { vec![7, 8] } else { vec![] })
            },
        );
        let listing = fetcher.collect_all().await.unwrap();
        assert_eq!(listing.records, vec![7, 8]);
        assert_eq!(listing.pages, 2);
    }

    #[tokio::test]
    async fn page_bound_marks_listing_truncated() {
        let fetcher = PagedFetcher::with_sleeper(
            "pages",
            paging(1, 3),
            Arc::new(RecordingSleeper::default()),
            |page| async move { Ok::<_, FakeError>(vec![page]) },
        );
        let listing = fetcher.collect_all().await.unwrap();
        assert_eq!(listing.records, vec![1, 2, 3]);
        assert!(listing.truncated);
    }

    #[tokio::test]
    async fn fatal_error_aborts_listing_and_stays_finished() {
        let mut fetcher = PagedFetcher::with_sleeper(
            "pages",
            paging(1, 10),
            Arc::new(RecordingSleeper::default()),
            |page| async move {
                if page == 2 {
                    Err(FakeError::Broken)
                } else {
                    Ok(vec![page])
                }
            },
        );
        assert_eq!(fetcher.next_page().await.unwrap(), Some(vec![1]));
        assert!(fetcher.next_page().await.is_err());
        assert_eq!(fetcher.next_page().await.unwrap(), None);
    }
}
