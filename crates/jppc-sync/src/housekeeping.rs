//! Company seeding and crawl-log retention.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jppc_core::NewCompany;
use jppc_storage::{RepoResult, Store};
use serde::Deserialize;
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct CompaniesFile {
    pub companies: Vec<NewCompany>,
}

pub async fn load_companies(path: &Path) -> Result<Vec<NewCompany>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CompaniesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.companies)
}

/// Upserts every company by code. Returns how many were written.
pub async fn seed_companies(store: &dyn Store, companies: &[NewCompany]) -> RepoResult<usize> {
    for company in companies {
        let stored = store.upsert_company(company).await?;
        info!(company = %stored.code, id = stored.id, active = stored.is_active, "company seeded");
    }
    Ok(companies.len())
}

/// Deletes crawl logs that started more than `retention_days` before `now`.
pub async fn prune_crawl_logs(store: &dyn Store, retention_days: i64, now: DateTime<Utc>) -> RepoResult<u64> {
    let cutoff = now - chrono::Duration::days(retention_days.max(0));
    let removed = store.purge_crawl_logs_before(cutoff).await?;
    info!(%cutoff, removed, "crawl logs pruned");
    Ok(removed)
}
