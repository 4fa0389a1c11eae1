//! In-process store with the same transactional semantics as Postgres.
//!
//! Used by tests and by `--memory` runs of the CLI.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jppc_core::{
    AlertKind, AlertRecipient, AlertSetting, Company, CrawlLog, CrawlLogFilter, CrawlLogUpdate,
    NewCompany, NewCrawlLog, NewPriceHistory, NewPricePlan, Page, PriceHistory, PricePlan,
};
use parking_lot::Mutex;

use crate::repository::{
    page_offset, AlertRepository, CompanyRepository, CrawlLogRepository, PlanRepository,
    PlanTransaction, RepoResult, RepositoryError,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    companies: Vec<Company>,
    plans: Vec<PricePlan>,
    history: Vec<PriceHistory>,
    logs: Vec<CrawlLog>,
    alert_settings: Vec<AlertSetting>,
    recipients: Vec<AlertRecipient>,
    rejected_plan_codes: HashSet<String>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn company_name(&self, company_id: Option<i64>) -> Option<String> {
        let company_id = company_id?;
        self.companies
            .iter()
            .find(|c| c.id == company_id)
            .map(|c| c.name_ja.clone())
    }

    fn with_company_name(&self, log: &CrawlLog) -> CrawlLog {
        CrawlLog {
            company_name: self.company_name(log.company_id),
            ..log.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with the default alert settings (price and failure alerts on, weekly off).
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for (kind, enabled) in [
            (AlertKind::PriceChange, true),
            (AlertKind::CrawlFailure, true),
            (AlertKind::WeeklyReport, false),
        ] {
            let id = state.allocate_id();
            state.alert_settings.push(AlertSetting {
                id,
                alert_type: kind,
                is_enabled: enabled,
            });
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Every commit that would write a plan with this code fails with a constraint error.
    pub fn reject_commits_for_plan(&self, plan_code: &str) {
        self.state
            .lock()
            .rejected_plan_codes
            .insert(plan_code.to_string());
    }

    pub fn add_recipient(&self, kind: AlertKind, email: &str) -> Option<AlertRecipient> {
        let mut state = self.state.lock();
        let setting_id = state.alert_settings.iter().find(|s| s.alert_type == kind)?.id;
        let id = state.allocate_id();
        let recipient = AlertRecipient {
            id,
            alert_setting_id: setting_id,
            email: email.to_string(),
            name: None,
            is_active: true,
        };
        state.recipients.push(recipient.clone());
        Some(recipient)
    }

    pub fn set_alert_enabled(&self, kind: AlertKind, enabled: bool) {
        let mut state = self.state.lock();
        for setting in state.alert_settings.iter_mut().filter(|s| s.alert_type == kind) {
            setting.is_enabled = enabled;
        }
    }

    pub fn all_plans(&self) -> Vec<PricePlan> {
        self.state.lock().plans.clone()
    }

    pub fn all_history(&self) -> Vec<PriceHistory> {
        self.state.lock().history.clone()
    }

    pub fn all_crawl_logs(&self) -> Vec<CrawlLog> {
        let state = self.state.lock();
        state.logs.iter().map(|l| state.with_company_name(l)).collect()
    }
}

fn check_plan_uniqueness<'a>(
    existing: impl Iterator<Item = &'a PricePlan>,
    superseded: &[i64],
    plan: &PricePlan,
) -> RepoResult<()> {
    for other in existing {
        if other.id == plan.id
            || other.company_id != plan.company_id
            || other.plan_code != plan.plan_code
        {
            continue;
        }
        if other.effective_date == plan.effective_date {
            return Err(RepositoryError::Constraint(format!(
                "duplicate price plan ({}, {}, {})",
                plan.company_id, plan.plan_code, plan.effective_date
            )));
        }
        if other.is_current && !superseded.contains(&other.id) {
            return Err(RepositoryError::Constraint(format!(
                "second current row for price plan ({}, {})",
                plan.company_id, plan.plan_code
            )));
        }
    }
    Ok(())
}

pub struct MemoryPlanTransaction {
    state: Arc<Mutex<MemoryState>>,
    inserted: Vec<PricePlan>,
    superseded: Vec<i64>,
    history: Vec<PriceHistory>,
}

#[async_trait]
impl PlanTransaction for MemoryPlanTransaction {
    async fn current_plan(
        &mut self,
        company_id: i64,
        plan_code: &str,
    ) -> RepoResult<Option<PricePlan>> {
        let staged = self
            .inserted
            .iter()
            .rev()
            .find(|p| p.company_id == company_id && p.plan_code == plan_code && p.is_current);
        if let Some(plan) = staged {
            return Ok(Some(plan.clone()));
        }
        let state = self.state.lock();
        Ok(state
            .plans
            .iter()
            .find(|p| {
                p.company_id == company_id
                    && p.plan_code == plan_code
                    && p.is_current
                    && !self.superseded.contains(&p.id)
            })
            .cloned())
    }

    async fn insert_plan(&mut self, plan: &NewPricePlan) -> RepoResult<PricePlan> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let row = PricePlan {
            id: state.allocate_id(),
            company_id: plan.company_id,
            plan_code: plan.plan_code.clone(),
            plan_name_ja: plan.plan_name_ja.clone(),
            plan_name_en: plan.plan_name_en.clone(),
            plan_type: plan.plan_type,
            contract_type: plan.contract_type.clone(),
            tariff: plan.tariff.clone(),
            effective_date: plan.effective_date,
            source_url: plan.source_url.clone(),
            raw_data: plan.raw_data.clone(),
            is_current: true,
            created_at: now,
            updated_at: now,
        };
        check_plan_uniqueness(
            state.plans.iter().chain(self.inserted.iter()),
            &self.superseded,
            &row,
        )?;
        drop(state);
        self.inserted.push(row.clone());
        Ok(row)
    }

    async fn mark_superseded(&mut self, plan_id: i64) -> RepoResult<()> {
        if let Some(staged) = self.inserted.iter_mut().find(|p| p.id == plan_id && p.is_current) {
            staged.is_current = false;
            return Ok(());
        }
        let state = self.state.lock();
        let exists = state
            .plans
            .iter()
            .any(|p| p.id == plan_id && p.is_current && !self.superseded.contains(&p.id));
        if !exists {
            return Err(RepositoryError::NotFound(format!("current price plan {plan_id}")));
        }
        drop(state);
        self.superseded.push(plan_id);
        Ok(())
    }

    async fn insert_history(&mut self, entry: &NewPriceHistory) -> RepoResult<PriceHistory> {
        let id = self.state.lock().allocate_id();
        let row = PriceHistory {
            id,
            price_plan_id: entry.price_plan_id,
            company_id: entry.company_id,
            plan_code: entry.plan_code.clone(),
            field_name: entry.field_name.clone(),
            old_value: entry.old_value.clone(),
            new_value: entry.new_value.clone(),
            change_kind: entry.change_kind,
            change_details: entry.change_details.clone(),
            changed_at: Utc::now(),
        };
        self.history.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        let this = *self;
        let mut state = this.state.lock();
        if let Some(rejected) = this
            .inserted
            .iter()
            .find(|p| state.rejected_plan_codes.contains(&p.plan_code))
        {
            return Err(RepositoryError::Constraint(format!(
                "commit rejected for plan {}",
                rejected.plan_code
            )));
        }
        for plan in &this.inserted {
            let others = state
                .plans
                .iter()
                .chain(this.inserted.iter().filter(|p| p.id != plan.id));
            check_plan_uniqueness(others, &this.superseded, plan)?;
        }

        let now = Utc::now();
        for plan in state.plans.iter_mut() {
            if this.superseded.contains(&plan.id) {
                plan.is_current = false;
                plan.updated_at = now;
            }
        }
        state.plans.extend(this.inserted);
        state.history.extend(this.history);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        Ok(())
    }
}

#[async_trait]
impl CompanyRepository for MemoryStore {
    async fn list_companies(&self, active_only: bool) -> RepoResult<Vec<Company>> {
        let state = self.state.lock();
        Ok(state
            .companies
            .iter()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect())
    }

    async fn companies_by_ids(&self, ids: &[i64]) -> RepoResult<Vec<Company>> {
        let state = self.state.lock();
        Ok(state
            .companies
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn company_by_code(&self, code: &str) -> RepoResult<Option<Company>> {
        let state = self.state.lock();
        Ok(state.companies.iter().find(|c| c.code == code).cloned())
    }

    async fn upsert_company(&self, company: &NewCompany) -> RepoResult<Company> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if let Some(existing) = state.companies.iter_mut().find(|c| c.code == company.code) {
            existing.name_ja = company.name_ja.clone();
            existing.name_en = company.name_en.clone();
            existing.name_ko = company.name_ko.clone();
            existing.website_url = company.website_url.clone();
            existing.price_page_url = company.price_page_url.clone();
            existing.region = company.region.clone();
            existing.description = company.description.clone();
            existing.is_active = company.is_active;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let row = Company {
            id: state.allocate_id(),
            code: company.code.clone(),
            name_ja: company.name_ja.clone(),
            name_en: company.name_en.clone(),
            name_ko: company.name_ko.clone(),
            website_url: company.website_url.clone(),
            price_page_url: company.price_page_url.clone(),
            region: company.region.clone(),
            description: company.description.clone(),
            is_active: company.is_active,
            created_at: now,
            updated_at: now,
        };
        state.companies.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl PlanRepository for MemoryStore {
    async fn begin_plan_write(&self) -> RepoResult<Box<dyn PlanTransaction>> {
        Ok(Box::new(MemoryPlanTransaction {
            state: self.state.clone(),
            inserted: Vec::new(),
            superseded: Vec::new(),
            history: Vec::new(),
        }))
    }

    async fn current_plans(&self, company_id: Option<i64>) -> RepoResult<Vec<PricePlan>> {
        let state = self.state.lock();
        let mut plans: Vec<_> = state
            .plans
            .iter()
            .filter(|p| p.is_current && company_id.map_or(true, |id| p.company_id == id))
            .cloned()
            .collect();
        plans.sort_by(|a, b| (a.company_id, &a.plan_code).cmp(&(b.company_id, &b.plan_code)));
        Ok(plans)
    }

    async fn plan_lineage(&self, company_id: i64, plan_code: &str) -> RepoResult<Vec<PricePlan>> {
        let state = self.state.lock();
        let mut plans: Vec<_> = state
            .plans
            .iter()
            .filter(|p| p.company_id == company_id && p.plan_code == plan_code)
            .cloned()
            .collect();
        plans.sort_by(|a, b| (b.effective_date, b.id).cmp(&(a.effective_date, a.id)));
        Ok(plans)
    }

    async fn plan_history(
        &self,
        company_id: i64,
        plan_code: &str,
    ) -> RepoResult<Vec<PriceHistory>> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .history
            .iter()
            .filter(|h| h.company_id == company_id && h.plan_code == plan_code)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.changed_at, b.id).cmp(&(a.changed_at, a.id)));
        Ok(rows)
    }
}

#[async_trait]
impl CrawlLogRepository for MemoryStore {
    async fn create_crawl_log(&self, log: &NewCrawlLog) -> RepoResult<CrawlLog> {
        let mut state = self.state.lock();
        let row = CrawlLog {
            id: state.allocate_id(),
            company_id: log.company_id,
            company_name: None,
            status: log.status,
            trigger_type: log.trigger_type,
            started_at: log.started_at,
            finished_at: None,
            duration_seconds: None,
            plans_found: 0,
            plans_created: 0,
            plans_updated: 0,
            error_message: None,
            error_details: None,
        };
        state.logs.push(row.clone());
        Ok(state.with_company_name(&row))
    }

    async fn update_crawl_log(&self, id: i64, update: &CrawlLogUpdate) -> RepoResult<bool> {
        let mut state = self.state.lock();
        let Some(log) = state.logs.iter_mut().find(|l| l.id == id) else {
            return Err(RepositoryError::NotFound(format!("crawl log {id}")));
        };
        if log.status.is_terminal() {
            return Ok(false);
        }
        if let Some(status) = update.status {
            log.status = status;
        }
        if let Some(finished_at) = update.finished_at {
            log.finished_at = Some(finished_at);
            log.duration_seconds = Some((finished_at - log.started_at).num_seconds());
        }
        if let Some(found) = update.plans_found {
            log.plans_found = found;
        }
        if let Some(created) = update.plans_created {
            log.plans_created = created;
        }
        if let Some(updated) = update.plans_updated {
            log.plans_updated = updated;
        }
        if update.error_message.is_some() {
            log.error_message = update.error_message.clone();
        }
        if update.error_details.is_some() {
            log.error_details = update.error_details.clone();
        }
        Ok(true)
    }

    async fn get_crawl_log(&self, id: i64) -> RepoResult<Option<CrawlLog>> {
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .find(|l| l.id == id)
            .map(|l| state.with_company_name(l)))
    }

    async fn list_crawl_logs(
        &self,
        filter: &CrawlLogFilter,
        page: u32,
        page_size: u32,
    ) -> RepoResult<Page<CrawlLog>> {
        let state = self.state.lock();
        let mut matching: Vec<&CrawlLog> = state
            .logs
            .iter()
            .filter(|l| filter.company_id.map_or(true, |id| l.company_id == Some(id)))
            .filter(|l| filter.status.map_or(true, |s| l.status == s))
            .collect();
        matching.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page_offset(page, page_size) as usize)
            .take(page_size as usize)
            .map(|l| state.with_company_name(l))
            .collect();
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn last_success_at(&self, company_id: Option<i64>) -> RepoResult<Option<DateTime<Utc>>> {
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .filter(|l| l.company_id == company_id && l.status == jppc_core::CrawlStatus::Success)
            .filter_map(|l| l.finished_at)
            .max())
    }

    async fn purge_crawl_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let mut state = self.state.lock();
        let before = state.logs.len();
        state
            .logs
            .retain(|l| l.started_at >= cutoff || !l.status.is_terminal());
        Ok((before - state.logs.len()) as u64)
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn alert_setting(&self, kind: AlertKind) -> RepoResult<Option<AlertSetting>> {
        let state = self.state.lock();
        Ok(state
            .alert_settings
            .iter()
            .find(|s| s.alert_type == kind)
            .cloned())
    }

    async fn alert_recipients(&self, kind: AlertKind) -> RepoResult<Vec<AlertRecipient>> {
        let state = self.state.lock();
        let Some(setting) = state.alert_settings.iter().find(|s| s.alert_type == kind) else {
            return Ok(Vec::new());
        };
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.alert_setting_id == setting.id && r.is_active)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use jppc_core::{ChangeKind, CrawlStatus, PlanType, Tariff, TriggerType};

    fn company() -> NewCompany {
        NewCompany {
            code: "tepco".into(),
            name_ja: "東京電力エナジーパートナー".into(),
            name_en: Some("TEPCO Energy Partner".into()),
            name_ko: None,
            website_url: None,
            price_page_url: None,
            region: Some("関東".into()),
            description: None,
            is_active: true,
        }
    }

    fn plan(company_id: i64, day: u32, base: f64) -> NewPricePlan {
        NewPricePlan {
            company_id,
            plan_code: "tepco_jyuryo_b".into(),
            plan_name_ja: "従量電灯B".into(),
            plan_name_en: None,
            plan_type: PlanType::Residential,
            contract_type: None,
            tariff: Tariff {
                base_charge: Some(base),
                ..Default::default()
            },
            effective_date: NaiveDate::from_ymd_opt(2024, 4, day).expect("date"),
            source_url: None,
            raw_data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_discarded_on_drop() {
        let store = MemoryStore::new();
        let company = store.upsert_company(&company()).await.expect("company");

        let mut tx = store.begin_plan_write().await.expect("begin");
        tx.insert_plan(&plan(company.id, 1, 858.0)).await.expect("insert");
        assert!(store.current_plans(None).await.expect("read").is_empty());
        drop(tx);

        assert!(store.all_plans().is_empty());
    }

    #[tokio::test]
    async fn supersede_commits_atomically() {
        let store = MemoryStore::new();
        let company = store.upsert_company(&company()).await.expect("company");

        let mut tx = store.begin_plan_write().await.expect("begin");
        let first = tx.insert_plan(&plan(company.id, 1, 858.0)).await.expect("insert");
        tx.commit().await.expect("commit");

        let mut tx = store.begin_plan_write().await.expect("begin");
        let current = tx
            .current_plan(company.id, "tepco_jyuryo_b")
            .await
            .expect("current")
            .expect("exists");
        assert_eq!(current.id, first.id);
        tx.mark_superseded(current.id).await.expect("supersede");
        let second = tx.insert_plan(&plan(company.id, 2, 900.0)).await.expect("insert");
        tx.insert_history(&NewPriceHistory {
            price_plan_id: second.id,
            company_id: company.id,
            plan_code: "tepco_jyuryo_b".into(),
            field_name: "base_charge".into(),
            old_value: Some("858.00".into()),
            new_value: Some("900.00".into()),
            change_kind: ChangeKind::Increase,
            change_details: None,
        })
        .await
        .expect("history");
        tx.commit().await.expect("commit");

        let current = store.current_plans(Some(company.id)).await.expect("current");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, second.id);
        assert_eq!(store.all_plans().len(), 2);
        assert_eq!(store.all_history().len(), 1);
    }

    #[tokio::test]
    async fn second_current_row_is_rejected() {
        let store = MemoryStore::new();
        let company = store.upsert_company(&company()).await.expect("company");
        let mut tx = store.begin_plan_write().await.expect("begin");
        tx.insert_plan(&plan(company.id, 1, 858.0)).await.expect("insert");
        tx.commit().await.expect("commit");

        let mut tx = store.begin_plan_write().await.expect("begin");
        let err = tx
            .insert_plan(&plan(company.id, 2, 900.0))
            .await
            .expect_err("still current");
        assert!(matches!(err, RepositoryError::Constraint(_)));
    }

    #[tokio::test]
    async fn terminal_crawl_logs_are_frozen() {
        let store = MemoryStore::new();
        let log = store
            .create_crawl_log(&NewCrawlLog {
                company_id: None,
                status: CrawlStatus::Running,
                trigger_type: TriggerType::Manual,
                started_at: Utc::now(),
            })
            .await
            .expect("create");
        assert!(store
            .update_crawl_log(log.id, &CrawlLogUpdate::status(CrawlStatus::Success))
            .await
            .expect("finish"));
        assert!(!store
            .update_crawl_log(log.id, &CrawlLogUpdate::status(CrawlStatus::Failed))
            .await
            .expect("frozen"));
        let stored = store.get_crawl_log(log.id).await.expect("get").expect("row");
        assert_eq!(stored.status, CrawlStatus::Success);
    }

    #[tokio::test]
    async fn crawl_logs_paginate_newest_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for offset in 0..5 {
            store
                .create_crawl_log(&NewCrawlLog {
                    company_id: None,
                    status: CrawlStatus::Running,
                    trigger_type: TriggerType::Scheduled,
                    started_at: base + chrono::Duration::minutes(offset),
                })
                .await
                .expect("create");
        }
        let page = store
            .list_crawl_logs(&CrawlLogFilter::default(), 2, 2)
            .await
            .expect("page");
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].started_at, base + chrono::Duration::minutes(2));
    }

    #[tokio::test]
    async fn purge_keeps_live_crawl_logs() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::days(120);
        let mut ids = Vec::new();
        for status in [CrawlStatus::Running, CrawlStatus::Pending, CrawlStatus::Success] {
            let log = store
                .create_crawl_log(&NewCrawlLog {
                    company_id: None,
                    status,
                    trigger_type: TriggerType::Scheduled,
                    started_at: old,
                })
                .await
                .expect("create");
            ids.push(log.id);
        }

        let removed = store
            .purge_crawl_logs_before(Utc::now() - chrono::Duration::days(90))
            .await
            .expect("purge");
        assert_eq!(removed, 1);
        let left: Vec<i64> = store.all_crawl_logs().iter().map(|l| l.id).collect();
        assert_eq!(left, ids[..2].to_vec());
        assert!(store
            .update_crawl_log(ids[0], &CrawlLogUpdate::status(CrawlStatus::Success))
            .await
            .expect("running row still updatable"));
    }
}
