//! Vendor crawler contract, per-vendor site crawlers and the crawler registry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jppc_core::RawPlanRecord;
use jppc_storage::{FetchError, FetchedPage, HttpFetcher, RateLimiter, RetryPolicy, RetryStop, Transience};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub mod dates;
pub mod registry;
pub mod tariff_page;
pub mod text;
pub mod vendors;

pub use dates::{parse_vendor_date, DateParseError};
pub use registry::{CrawlerRegistry, RegistryError};
pub use tariff_page::{parse_tariff_page, PageLayout, PageParseError, ParsedTariff, PlanPage};
pub use vendors::{SiteCrawler, Vendor};

pub const CRATE_NAME: &str = "jppc-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStage {
    Fetch,
    Navigate,
    Parse,
}

impl fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrawlStage::Fetch => "fetch",
            CrawlStage::Navigate => "navigate",
            CrawlStage::Parse => "parse",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{vendor} {stage} failed after {attempts} attempt(s): {cause}")]
pub struct CrawlError {
    pub vendor: String,
    pub stage: CrawlStage,
    pub kind: FailureKind,
    pub cause: String,
    pub attempts: u32,
}

impl CrawlError {
    fn new(vendor: impl fmt::Display, stage: CrawlStage, kind: FailureKind, cause: String) -> Self {
        Self {
            vendor: vendor.to_string(),
            stage,
            kind,
            cause,
            attempts: 1,
        }
    }

    pub fn transient(vendor: impl fmt::Display, stage: CrawlStage, cause: impl Into<String>) -> Self {
        Self::new(vendor, stage, FailureKind::Transient, cause.into())
    }

    pub fn permanent(vendor: impl fmt::Display, stage: CrawlStage, cause: impl Into<String>) -> Self {
        Self::new(vendor, stage, FailureKind::Permanent, cause.into())
    }

    pub fn cancelled(vendor: impl fmt::Display, stage: CrawlStage) -> Self {
        Self::new(vendor, stage, FailureKind::Cancelled, "crawl cancelled".to_string())
    }

    pub fn from_fetch(vendor: impl fmt::Display, err: &FetchError) -> Self {
        if err.is_transient() {
            Self::transient(vendor, CrawlStage::Fetch, err.to_string())
        } else {
            Self::permanent(vendor, CrawlStage::Fetch, err.to_string())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

impl Transience for CrawlError {
    fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Everything a crawler needs from the running job: pacing, retry, timeout and cancellation.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub job_id: Uuid,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
    pub page_timeout: Duration,
    pub cancel: CancellationToken,
}

impl CrawlContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self, vendor: impl fmt::Display) -> Result<(), CrawlError> {
        if self.cancel.is_cancelled() {
            Err(CrawlError::cancelled(vendor, CrawlStage::Navigate))
        } else {
            Ok(())
        }
    }

    /// Fetches one page under the vendor's rate limit, the page timeout and the retry policy.
    pub async fn fetch_page(
        &self,
        http: &HttpFetcher,
        vendor: Vendor,
        url: &str,
    ) -> Result<FetchedPage, CrawlError> {
        let key = vendor.code();
        self.retry
            .run(&self.cancel, |attempt| async move {
                let step = async {
                    self.limiter.acquire(key).await;
                    debug!(job_id = %self.job_id, vendor = key, url, attempt, "fetching page");
                    tokio::time::timeout(self.page_timeout, http.fetch_text(key, url)).await
                };
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(CrawlError::cancelled(vendor, CrawlStage::Fetch)),
                    outcome = step => match outcome {
                        Err(_elapsed) => Err(CrawlError::transient(
                            vendor,
                            CrawlStage::Navigate,
                            format!("no response within {}s from {url}", self.page_timeout.as_secs()),
                        )),
                        Ok(Err(err)) => Err(CrawlError::from_fetch(vendor, &err)),
                        Ok(Ok(page)) => Ok(page),
                    },
                }
            })
            .await
            .map_err(|failure| {
                let mut err = failure.error;
                err.attempts = failure.attempts;
                if failure.stop == RetryStop::Cancelled {
                    err.kind = FailureKind::Cancelled;
                }
                err
            })
    }
}

/// Fetches and parses one power company's tariff pages.
#[async_trait]
pub trait VendorCrawler: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn price_page_urls(&self) -> Vec<String>;

    /// Records in page traversal order. Never touches storage.
    async fn discover_plans(&self, ctx: &CrawlContext) -> Result<Vec<RawPlanRecord>, CrawlError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use jppc_storage::{HttpClientConfig, RateLimiterConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct FlakyThenOk {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl Respond for FlakyThenOk {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_string("<table></table>")
            }
        }
    }

    fn context(max_attempts: u32) -> CrawlContext {
        CrawlContext {
            job_id: Uuid::new_v4(),
            limiter: Arc::new(RateLimiter::new(RateLimiterConfig::uniform(Duration::ZERO))),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                jitter: 0.0,
            },
            page_timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_budget() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/plan"))
            .respond_with(FlakyThenOk {
                calls: calls.clone(),
                failures: 2,
            })
            .mount(&server)
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let page = context(3)
            .fetch_page(&http, Vendor::Tepco, &format!("{}/plan", server.uri()))
            .await
            .expect("third attempt succeeds");
        assert_eq!(page.body, "<table></table>");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let err = context(3)
            .fetch_page(&http, Vendor::Chubu, &format!("{}/plan", server.uri()))
            .await
            .expect_err("always failing");
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.vendor, "chubu");
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");

        let err = context(3)
            .fetch_page(&http, Vendor::Kepco, &format!("{}/missing", server.uri()))
            .await
            .expect_err("404");
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn slow_pages_time_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let ctx = CrawlContext {
            page_timeout: Duration::from_millis(50),
            ..context(2)
        };

        let err = ctx
            .fetch_page(&http, Vendor::Chugoku, &format!("{}/slow", server.uri()))
            .await
            .expect_err("timeout");
        assert_eq!(err.stage, CrawlStage::Navigate);
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn cancelled_context_stops_fetching() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let ctx = context(3);
        ctx.cancel.cancel();
        let err = ctx
            .fetch_page(&http, Vendor::Tepco, "http://127.0.0.1:9/never")
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(ctx.checkpoint(Vendor::Tepco).is_err());
    }
}
