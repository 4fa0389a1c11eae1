//! Storage and outbound-HTTP plumbing for JPPC: repositories, request pacing and retry.

pub mod http;
pub mod memory;
pub mod pacing;
pub mod postgres;
pub mod repository;
pub mod retry;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use pacing::{RateLimiter, RateLimiterConfig};
pub use postgres::PgStore;
pub use repository::{
    AlertRepository, CompanyRepository, CrawlLogRepository, PlanRepository, PlanTransaction,
    RepoResult, RepositoryError, Store,
};
pub use retry::{RetryError, RetryPolicy, RetryStop, Transience};

pub const CRATE_NAME: &str = "jppc-storage";
