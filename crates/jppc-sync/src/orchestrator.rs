//! Runs one crawl job at a time: a supervised task per company, each plan reconciled and
//! written in its own transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jppc_adapters::{CrawlContext, CrawlError, CrawlerRegistry, RegistryError};
use jppc_core::{
    AlertKind, Company, CrawlLogUpdate, CrawlStatus, NewCrawlLog, PricePlan, RawPlanRecord, TriggerType,
};
use jppc_storage::{RateLimiter, RepositoryError, RetryPolicy, Store};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::alerts::{dispatch, Notifier};
use crate::job::{derive_status, CompanyRun, CrawlerStatus, JobBoard, JobSnapshot, JobStateError, RunGuard, RunSlot};
use crate::reconcile::{collapse_duplicates, FieldChange, ReconcileAction, Reconciler};
use crate::schedule::jst_today;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("crawl job {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("no active company matches the request")]
    NoCompanies,
    #[error("every requested company was crawled successfully within the last {0} hours")]
    RecentlyCrawled(i64),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("crawl job launch aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// `None` or empty means every active company.
    pub company_ids: Option<Vec<i64>>,
    pub force: bool,
    pub trigger: TriggerType,
}

impl StartRequest {
    pub fn manual(company_ids: Option<Vec<i64>>, force: bool) -> Self {
        Self {
            company_ids,
            force,
            trigger: TriggerType::Manual,
        }
    }

    pub fn scheduled() -> Self {
        Self {
            company_ids: None,
            force: false,
            trigger: TriggerType::Scheduled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedJob {
    pub job_id: Uuid,
    pub status: CrawlStatus,
    pub companies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub page_timeout: Duration,
    pub recrawl_window: Option<chrono::Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            page_timeout: Duration::from_secs(30),
            recrawl_window: None,
        }
    }
}

#[derive(Debug, Error)]
enum CompanyFailure {
    #[error(transparent)]
    UnknownVendor(#[from] RegistryError),
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error("storing plan {plan_code} failed: {source}")]
    Persistence {
        plan_code: String,
        #[source]
        source: RepositoryError,
    },
    #[error("crawl cancelled")]
    Cancelled,
}

impl CompanyFailure {
    fn status(&self) -> CrawlStatus {
        match self {
            CompanyFailure::Cancelled => CrawlStatus::Cancelled,
            CompanyFailure::Crawl(err) if err.is_cancelled() => CrawlStatus::Cancelled,
            _ => CrawlStatus::Failed,
        }
    }

    fn details(&self) -> Value {
        match self {
            CompanyFailure::UnknownVendor(RegistryError::UnknownVendor(code)) => {
                json!({ "kind": "unknown_vendor", "company_code": code })
            }
            CompanyFailure::Crawl(err) => json!({ "kind": "crawl", "error": err }),
            CompanyFailure::Persistence { plan_code, source } => json!({
                "kind": "persistence",
                "plan_code": plan_code,
                "error": source.to_string(),
            }),
            CompanyFailure::Cancelled => json!({ "kind": "cancelled" }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    found: u32,
    created: u32,
    updated: u32,
}

enum Persisted {
    Created,
    Superseded {
        previous: Option<PricePlan>,
        plan: PricePlan,
        changes: Vec<FieldChange>,
    },
    Unchanged,
}

struct CompanyOutcome {
    status: CrawlStatus,
    tally: Tally,
    error: Option<String>,
    details: Option<Value>,
}

struct JobPlan {
    job_id: Uuid,
    cancel: CancellationToken,
    trigger: TriggerType,
    job_log_id: i64,
    companies: Vec<(Company, i64)>,
}

struct Inner {
    store: Arc<dyn Store>,
    registry: CrawlerRegistry,
    limiter: Arc<RateLimiter>,
    notifier: Arc<dyn Notifier>,
    board: Arc<JobBoard>,
    slot: RunSlot,
    settings: OrchestratorSettings,
    reconciler: Reconciler,
}

#[derive(Clone)]
pub struct CrawlOrchestrator {
    inner: Arc<Inner>,
}

impl CrawlOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: CrawlerRegistry,
        limiter: Arc<RateLimiter>,
        notifier: Arc<dyn Notifier>,
        board: Arc<JobBoard>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                limiter,
                notifier,
                board,
                slot: Arc::default(),
                settings,
                reconciler: Reconciler::new(),
            }),
        }
    }

    pub fn status(&self) -> CrawlerStatus {
        self.inner.board.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CrawlerStatus> {
        self.inner.board.subscribe()
    }

    pub fn publish_next_run(&self, at: Option<chrono::DateTime<Utc>>) {
        self.inner.board.set_next_scheduled_at(at);
    }

    /// Seeds `last_run_at` from the latest successful job log so status survives restarts.
    pub async fn restore_last_run(&self) -> Result<(), OrchestratorError> {
        let last = self.inner.store.last_success_at(None).await?;
        self.inner.board.set_last_run_at(last);
        Ok(())
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartedJob, OrchestratorError> {
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let guard = RunGuard::acquire(&self.inner.slot, &self.inner.board, job_id, cancel.clone())
            .map_err(OrchestratorError::AlreadyRunning)?;

        // detached: a caller that goes away must not strand half-opened crawl logs
        let launch = tokio::spawn(self.inner.clone().launch(guard, job_id, cancel, request));
        launch
            .await
            .map_err(|err| OrchestratorError::Aborted(err.to_string()))?
    }

    /// Cancels the running job and waits until it has unwound. Returns `false` when idle.
    ///
    /// A stop that lands before the job is published still cancels it; the job then starts
    /// with every company cancelled.
    pub async fn stop(&self) -> bool {
        let active = self.inner.slot.lock().clone();
        let Some(active) = active else {
            return false;
        };
        info!(job_id = %active.job_id, "stop requested");
        self.inner.board.request_cancel(active.job_id);
        active.cancel.cancel();
        self.wait_for(active.job_id).await;
        true
    }

    /// Resolves once `job_id` is terminal, replaced on the board, or gave up before it was
    /// published.
    pub async fn wait_for(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let slot = self.inner.slot.clone();
        let mut rx = self.inner.board.subscribe();
        let state = rx
            .wait_for(|state| match &state.current_job {
                Some(job) if job.job_id == job_id => job.status.is_terminal(),
                _ => !holds_slot(&slot, job_id),
            })
            .await
            .ok()?;
        state.current_job.clone().filter(|job| job.job_id == job_id)
    }
}

fn holds_slot(slot: &RunSlot, job_id: Uuid) -> bool {
    slot.lock().as_ref().is_some_and(|run| run.job_id == job_id)
}

impl Inner {
    async fn launch(
        self: Arc<Self>,
        guard: RunGuard,
        job_id: Uuid,
        cancel: CancellationToken,
        request: StartRequest,
    ) -> Result<StartedJob, OrchestratorError> {
        let companies = self.resolve_companies(&request).await?;
        let started_at = Utc::now();
        let mut opened = Vec::with_capacity(companies.len() + 1);
        let (job_log_id, planned) = match self
            .open_logs(companies, request.trigger, started_at, &mut opened)
            .await
        {
            Ok(logs) => logs,
            Err(err) => {
                warn!(%job_id, error = %err, "crawl job could not start");
                self.close_abandoned_logs(&opened, &format!("crawl job could not start: {err}"))
                    .await;
                return Err(err.into());
            }
        };

        let runs = planned
            .iter()
            .map(|(company, log_id)| {
                CompanyRun::pending(company.id, &company.code, &company.name_ja, Some(*log_id))
            })
            .collect();
        let codes: Vec<String> = planned.iter().map(|(c, _)| c.code.clone()).collect();
        self.board.begin_job(JobSnapshot {
            job_id,
            status: CrawlStatus::Running,
            trigger: request.trigger,
            force: request.force,
            crawl_log_id: Some(job_log_id),
            companies: runs,
            // a stop may have landed before the job was published
            cancel_requested: cancel.is_cancelled(),
            created_at: started_at,
            started_at: Some(started_at),
            finished_at: None,
        });
        info!(%job_id, trigger = %request.trigger, force = request.force, companies = ?codes, "crawl job started");

        let span = info_span!("crawl_job", %job_id, trigger = %request.trigger);
        let plan = JobPlan {
            job_id,
            cancel,
            trigger: request.trigger,
            job_log_id,
            companies: planned,
        };
        tokio::spawn(self.supervise(guard, plan).instrument(span));

        Ok(StartedJob {
            job_id,
            status: CrawlStatus::Running,
            companies: codes,
        })
    }

    /// Writes the running job log and one pending log per company. Every id written is pushed
    /// to `opened`, including on failure.
    async fn open_logs(
        &self,
        companies: Vec<Company>,
        trigger: TriggerType,
        started_at: chrono::DateTime<Utc>,
        opened: &mut Vec<i64>,
    ) -> Result<(i64, Vec<(Company, i64)>), RepositoryError> {
        let job_log = self
            .store
            .create_crawl_log(&NewCrawlLog {
                company_id: None,
                status: CrawlStatus::Running,
                trigger_type: trigger,
                started_at,
            })
            .await?;
        opened.push(job_log.id);

        let mut planned = Vec::with_capacity(companies.len());
        for company in companies {
            let log = self
                .store
                .create_crawl_log(&NewCrawlLog {
                    company_id: Some(company.id),
                    status: CrawlStatus::Pending,
                    trigger_type: trigger,
                    started_at,
                })
                .await?;
            opened.push(log.id);
            planned.push((company, log.id));
        }
        Ok((job_log.id, planned))
    }

    async fn close_abandoned_logs(&self, log_ids: &[i64], reason: &str) {
        let update = CrawlLogUpdate {
            status: Some(CrawlStatus::Failed),
            finished_at: Some(Utc::now()),
            error_message: Some(reason.to_string()),
            ..Default::default()
        };
        for &log_id in log_ids {
            self.write_log(log_id, &update).await;
        }
    }

    async fn resolve_companies(&self, request: &StartRequest) -> Result<Vec<Company>, OrchestratorError> {
        let mut companies = match request.company_ids.as_deref() {
            Some(ids) if !ids.is_empty() => self.store.companies_by_ids(ids).await?,
            _ => self.store.list_companies(true).await?,
        };
        companies.retain(|c| c.is_active);
        if companies.is_empty() {
            return Err(OrchestratorError::NoCompanies);
        }

        let window = match self.settings.recrawl_window {
            Some(window) if !request.force => window,
            _ => return Ok(companies),
        };
        let cutoff = Utc::now() - window;
        let mut due = Vec::with_capacity(companies.len());
        for company in companies {
            match self.store.last_success_at(Some(company.id)).await? {
                Some(at) if at > cutoff => {
                    info!(company = %company.code, last_success = %at, "skipping recently crawled company");
                }
                _ => due.push(company),
            }
        }
        if due.is_empty() {
            return Err(OrchestratorError::RecentlyCrawled(window.num_hours()));
        }
        Ok(due)
    }

    async fn supervise(self: Arc<Self>, guard: RunGuard, plan: JobPlan) {
        let JobPlan {
            job_id,
            cancel,
            trigger,
            job_log_id,
            companies,
        } = plan;
        let ctx = CrawlContext {
            job_id,
            limiter: self.limiter.clone(),
            retry: self.settings.retry,
            page_timeout: self.settings.page_timeout,
            cancel: cancel.clone(),
        };

        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();
        for (company, log_id) in companies {
            let inner = self.clone();
            let ctx = ctx.clone();
            let company_id = company.id;
            let span = info_span!("crawl_company", %job_id, company = %company.code);
            let handle = tasks.spawn(
                async move { inner.run_company(&ctx, company, log_id).await }.instrument(span),
            );
            owners.insert(handle.id(), (company_id, log_id));
        }

        let mut broken: Option<JobStateError> = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(err))) => {
                    error!(%job_id, error = %err, "job state invariant violated");
                    broken.get_or_insert(err);
                }
                Err(join_err) => {
                    let Some(&(company_id, log_id)) = owners.get(&join_err.id()) else {
                        continue;
                    };
                    error!(%job_id, company_id, error = %join_err, "company task died");
                    let outcome = CompanyOutcome {
                        status: CrawlStatus::Failed,
                        tally: Tally::default(),
                        error: Some(format!("company task died: {join_err}")),
                        details: None,
                    };
                    if let Err(err) = self.record_outcome(job_id, company_id, log_id, outcome).await {
                        broken.get_or_insert(err);
                    }
                }
            }
        }

        let Some(snapshot) = self.board.snapshot().current_job.filter(|j| j.job_id == job_id) else {
            error!(%job_id, "job vanished from the board");
            guard.fail("job state lost");
            return;
        };
        let status = derive_status(&snapshot.companies, cancel.is_cancelled());
        // every task has been joined, so a job still running means a company run never ended
        let invariant = broken.or_else(|| {
            (status == CrawlStatus::Running).then(|| JobStateError::IllegalTransition {
                scope: "job".to_string(),
                from: CrawlStatus::Running,
                to: CrawlStatus::Running,
            })
        });
        if let Some(err) = invariant {
            self.write_log(
                job_log_id,
                &CrawlLogUpdate {
                    status: Some(CrawlStatus::Failed),
                    finished_at: Some(Utc::now()),
                    error_message: Some(err.to_string()),
                    ..Default::default()
                },
            )
            .await;
            guard.fail(&err.to_string());
            return;
        }

        let (found, created, updated) = snapshot.totals();
        let failures: Vec<Value> = snapshot
            .companies
            .iter()
            .filter(|c| c.status == CrawlStatus::Failed)
            .map(|c| json!({ "company_code": c.company_code, "company_name": c.company_name, "error": c.error }))
            .collect();
        let error_message = (!failures.is_empty()).then(|| {
            let codes: Vec<&str> = snapshot
                .companies
                .iter()
                .filter(|c| c.status == CrawlStatus::Failed)
                .map(|c| c.company_code.as_str())
                .collect();
            format!("{} of {} companies failed: {}", codes.len(), snapshot.companies.len(), codes.join(", "))
        });
        self.write_log(
            job_log_id,
            &CrawlLogUpdate {
                status: Some(status),
                finished_at: Some(Utc::now()),
                plans_found: Some(clamp_count(found)),
                plans_created: Some(clamp_count(created)),
                plans_updated: Some(clamp_count(updated)),
                error_message,
                error_details: (!failures.is_empty()).then(|| json!({ "companies": failures })),
            },
        )
        .await;

        let finished = match guard.complete(status) {
            Ok(finished) => finished,
            Err(err) => {
                error!(%job_id, error = %err, "could not finish job");
                return;
            }
        };
        info!(%job_id, status = %finished.status, found, created, updated, "crawl job finished");

        if !failures.is_empty() {
            dispatch(
                self.store.clone(),
                self.notifier.clone(),
                AlertKind::CrawlFailure,
                json!({ "job_id": job_id, "status": finished.status, "failures": failures }),
            );
        }
        if trigger == TriggerType::Scheduled {
            dispatch(
                self.store.clone(),
                self.notifier.clone(),
                AlertKind::WeeklyReport,
                json!({
                    "job_id": job_id,
                    "status": finished.status,
                    "plans_found": found,
                    "plans_created": created,
                    "plans_updated": updated,
                    "companies": finished.companies,
                }),
            );
        }
    }

    async fn run_company(&self, ctx: &CrawlContext, company: Company, log_id: i64) -> Result<(), JobStateError> {
        let job_id = ctx.job_id;
        if ctx.is_cancelled() {
            let outcome = CompanyOutcome {
                status: CrawlStatus::Cancelled,
                tally: Tally::default(),
                error: None,
                details: None,
            };
            return self.record_outcome(job_id, company.id, log_id, outcome).await;
        }

        self.board.update_company(job_id, company.id, Some(CrawlStatus::Running), |run| {
            run.started_at = Some(Utc::now());
        })?;
        self.write_log(log_id, &CrawlLogUpdate::status(CrawlStatus::Running)).await;

        let mut tally = Tally::default();
        let outcome = match self.crawl_company(ctx, &company, &mut tally).await {
            Ok(()) => {
                info!(found = tally.found, created = tally.created, updated = tally.updated, "company crawl succeeded");
                CompanyOutcome {
                    status: CrawlStatus::Success,
                    tally,
                    error: None,
                    details: None,
                }
            }
            Err(failure) => {
                let status = failure.status();
                if status == CrawlStatus::Cancelled {
                    info!("company crawl cancelled");
                } else {
                    warn!(error = %failure, "company crawl failed");
                }
                CompanyOutcome {
                    status,
                    tally,
                    error: (status == CrawlStatus::Failed).then(|| failure.to_string()),
                    details: Some(failure.details()),
                }
            }
        };
        self.record_outcome(job_id, company.id, log_id, outcome).await
    }

    async fn crawl_company(
        &self,
        ctx: &CrawlContext,
        company: &Company,
        tally: &mut Tally,
    ) -> Result<(), CompanyFailure> {
        let crawler = self.registry.get(&company.code)?;
        let records = crawler.discover_plans(ctx).await?;
        let records = collapse_duplicates(&company.code, records);
        tally.found = records.len() as u32;
        self.publish_progress(ctx.job_id, company.id, *tally);

        for record in &records {
            if ctx.is_cancelled() {
                return Err(CompanyFailure::Cancelled);
            }
            match self.persist_plan(ctx, company, record).await? {
                Persisted::Created => tally.created += 1,
                Persisted::Superseded {
                    previous,
                    plan,
                    changes,
                } => {
                    tally.updated += 1;
                    dispatch(
                        self.store.clone(),
                        self.notifier.clone(),
                        AlertKind::PriceChange,
                        json!({
                            "company_code": company.code,
                            "company_name": company.name_ja,
                            "plan_code": plan.plan_code,
                            "plan_name": plan.plan_name_ja,
                            "previous_plan_id": previous.map(|p| p.id),
                            "plan_id": plan.id,
                            "effective_date": plan.effective_date,
                            "changes": changes,
                        }),
                    );
                }
                Persisted::Unchanged => {}
            }
            self.publish_progress(ctx.job_id, company.id, *tally);
        }
        Ok(())
    }

    /// Reconciles one record and writes the result atomically. Nothing is committed once the
    /// job is cancelled.
    async fn persist_plan(
        &self,
        ctx: &CrawlContext,
        company: &Company,
        record: &RawPlanRecord,
    ) -> Result<Persisted, CompanyFailure> {
        let persistence = |source| CompanyFailure::Persistence {
            plan_code: record.plan_code.clone(),
            source,
        };

        let mut tx = self.store.begin_plan_write().await.map_err(persistence)?;
        let current = tx
            .current_plan(company.id, &record.plan_code)
            .await
            .map_err(persistence)?;
        let result = self
            .reconciler
            .reconcile(company.id, record, current.as_ref(), jst_today(Utc::now()));

        let Some(new_plan) = result.new_plan else {
            tx.rollback().await.map_err(persistence)?;
            debug!(plan_code = %record.plan_code, "plan unchanged");
            return Ok(Persisted::Unchanged);
        };
        if let (ReconcileAction::Supersede, Some(previous)) = (result.action, current.as_ref()) {
            tx.mark_superseded(previous.id).await.map_err(persistence)?;
        }
        let plan = tx.insert_plan(&new_plan).await.map_err(persistence)?;
        for change in result.changes.iter().cloned() {
            tx.insert_history(&change.into_history(plan.id, company.id, &record.plan_code))
                .await
                .map_err(persistence)?;
        }

        if ctx.is_cancelled() {
            if let Err(err) = tx.rollback().await {
                warn!(plan_code = %record.plan_code, error = %err, "rollback after cancel failed");
            }
            return Err(CompanyFailure::Cancelled);
        }
        tx.commit().await.map_err(persistence)?;

        debug!(
            plan_code = %record.plan_code,
            action = ?result.action,
            changes = result.changes.len(),
            "plan written"
        );
        Ok(match result.action {
            ReconcileAction::Supersede => Persisted::Superseded {
                previous: current,
                plan,
                changes: result.changes,
            },
            _ => Persisted::Created,
        })
    }

    fn publish_progress(&self, job_id: Uuid, company_id: i64, tally: Tally) {
        if let Err(err) = self.board.update_company(job_id, company_id, None, |run| {
            run.plans_found = tally.found;
            run.plans_created = tally.created;
            run.plans_updated = tally.updated;
        }) {
            debug!(error = %err, "progress not published");
        }
    }

    /// Terminal crawl log first, then the board, so readers never see a finished job with
    /// open logs.
    async fn record_outcome(
        &self,
        job_id: Uuid,
        company_id: i64,
        log_id: i64,
        outcome: CompanyOutcome,
    ) -> Result<(), JobStateError> {
        let now = Utc::now();
        self.write_log(
            log_id,
            &CrawlLogUpdate {
                status: Some(outcome.status),
                finished_at: Some(now),
                plans_found: Some(clamp_count(outcome.tally.found)),
                plans_created: Some(clamp_count(outcome.tally.created)),
                plans_updated: Some(clamp_count(outcome.tally.updated)),
                error_message: outcome.error.clone(),
                error_details: outcome.details,
            },
        )
        .await;
        self.board
            .update_company(job_id, company_id, Some(outcome.status), |run| {
                run.plans_found = outcome.tally.found;
                run.plans_created = outcome.tally.created;
                run.plans_updated = outcome.tally.updated;
                run.error = outcome.error;
                run.finished_at = Some(now);
            })
            .map(|_| ())
    }

    async fn write_log(&self, log_id: i64, update: &CrawlLogUpdate) {
        match self.store.update_crawl_log(log_id, update).await {
            Ok(true) => {}
            Ok(false) => debug!(log_id, "crawl log already terminal"),
            Err(err) => warn!(log_id, error = %err, "crawl log update failed"),
        }
    }
}

fn clamp_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}
