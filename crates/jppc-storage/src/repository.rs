//! Persistence contract used by the crawl orchestrator and the API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jppc_core::{
    AlertKind, AlertRecipient, AlertSetting, Company, CrawlLog, CrawlLogFilter, CrawlLogUpdate,
    NewCompany, NewCrawlLog, NewPriceHistory, NewPricePlan, Page, PriceHistory, PricePlan,
    UnknownVariant,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("corrupt row: {0}")]
    Decode(#[from] UnknownVariant),
    #[error("{0} not found")]
    NotFound(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn list_companies(&self, active_only: bool) -> RepoResult<Vec<Company>>;
    async fn companies_by_ids(&self, ids: &[i64]) -> RepoResult<Vec<Company>>;
    async fn company_by_code(&self, code: &str) -> RepoResult<Option<Company>>;
    async fn upsert_company(&self, company: &NewCompany) -> RepoResult<Company>;
}

/// Writes for one reconciled plan. Nothing is visible to readers until `commit`;
/// dropping the transaction without committing discards every staged write.
#[async_trait]
pub trait PlanTransaction: Send {
    async fn current_plan(&mut self, company_id: i64, plan_code: &str)
        -> RepoResult<Option<PricePlan>>;
    async fn insert_plan(&mut self, plan: &NewPricePlan) -> RepoResult<PricePlan>;
    async fn mark_superseded(&mut self, plan_id: i64) -> RepoResult<()>;
    async fn insert_history(&mut self, entry: &NewPriceHistory) -> RepoResult<PriceHistory>;
    async fn commit(self: Box<Self>) -> RepoResult<()>;
    async fn rollback(self: Box<Self>) -> RepoResult<()>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn begin_plan_write(&self) -> RepoResult<Box<dyn PlanTransaction>>;
    async fn current_plans(&self, company_id: Option<i64>) -> RepoResult<Vec<PricePlan>>;
    /// Every row of a plan lineage, newest first.
    async fn plan_lineage(&self, company_id: i64, plan_code: &str) -> RepoResult<Vec<PricePlan>>;
    async fn plan_history(&self, company_id: i64, plan_code: &str)
        -> RepoResult<Vec<PriceHistory>>;
}

#[async_trait]
pub trait CrawlLogRepository: Send + Sync {
    async fn create_crawl_log(&self, log: &NewCrawlLog) -> RepoResult<CrawlLog>;
    /// Applies `update` unless the row is already terminal. Returns whether a row changed.
    async fn update_crawl_log(&self, id: i64, update: &CrawlLogUpdate) -> RepoResult<bool>;
    async fn get_crawl_log(&self, id: i64) -> RepoResult<Option<CrawlLog>>;
    async fn list_crawl_logs(
        &self,
        filter: &CrawlLogFilter,
        page: u32,
        page_size: u32,
    ) -> RepoResult<Page<CrawlLog>>;
    /// Finish time of the latest successful crawl; `None` company means job-level rows.
    async fn last_success_at(&self, company_id: Option<i64>) -> RepoResult<Option<DateTime<Utc>>>;
    async fn purge_crawl_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn alert_setting(&self, kind: AlertKind) -> RepoResult<Option<AlertSetting>>;
    async fn alert_recipients(&self, kind: AlertKind) -> RepoResult<Vec<AlertRecipient>>;
}

/// Everything the crawler needs from storage, usable as one trait object.
pub trait Store: CompanyRepository + PlanRepository + CrawlLogRepository + AlertRepository {}

impl<T> Store for T where T: CompanyRepository + PlanRepository + CrawlLogRepository + AlertRepository
{}

pub(crate) fn page_offset(page: u32, page_size: u32) -> i64 {
    i64::from(page.max(1) - 1) * i64::from(page_size)
}
