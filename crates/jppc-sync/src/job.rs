//! In-memory crawl job state, published through a single-writer watch channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jppc_core::{CrawlStatus, TriggerType};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("illegal {scope} transition {from} -> {to}")]
    IllegalTransition {
        scope: String,
        from: CrawlStatus,
        to: CrawlStatus,
    },
    #[error("company {0} is not part of the current job")]
    UnknownCompany(i64),
    #[error("job {0} is not the current job")]
    StaleJob(Uuid),
}

/// Legal moves of the job and per-company state machines.
pub fn check_transition(scope: &str, from: CrawlStatus, to: CrawlStatus) -> Result<(), JobStateError> {
    use CrawlStatus::*;
    let legal = matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Running, Success)
            | (Running, Failed)
            | (Running, Partial)
            | (Running, Cancelled)
    );
    if legal {
        Ok(())
    } else {
        Err(JobStateError::IllegalTransition {
            scope: scope.to_string(),
            from,
            to,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyRun {
    pub company_id: i64,
    pub company_code: String,
    pub company_name: String,
    pub status: CrawlStatus,
    pub crawl_log_id: Option<i64>,
    pub plans_found: u32,
    pub plans_created: u32,
    pub plans_updated: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CompanyRun {
    pub fn pending(company_id: i64, code: &str, name: &str, crawl_log_id: Option<i64>) -> Self {
        Self {
            company_id,
            company_code: code.to_string(),
            company_name: name.to_string(),
            status: CrawlStatus::Pending,
            crawl_log_id,
            plans_found: 0,
            plans_created: 0,
            plans_updated: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: CrawlStatus,
    pub trigger: TriggerType,
    pub force: bool,
    pub crawl_log_id: Option<i64>,
    pub companies: Vec<CompanyRun>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn company(&self, company_id: i64) -> Option<&CompanyRun> {
        self.companies.iter().find(|c| c.company_id == company_id)
    }

    pub fn totals(&self) -> (u32, u32, u32) {
        self.companies.iter().fold((0, 0, 0), |(f, c, u), run| {
            (f + run.plans_found, c + run.plans_created, u + run.plans_updated)
        })
    }
}

/// Job status from its company runs: running while any company is unfinished, cancelled when
/// a stop was requested, otherwise success, failed or partial.
pub fn derive_status(companies: &[CompanyRun], cancel_requested: bool) -> CrawlStatus {
    if companies.iter().any(|c| !c.status.is_terminal()) {
        return CrawlStatus::Running;
    }
    if cancel_requested {
        return CrawlStatus::Cancelled;
    }
    let succeeded = companies
        .iter()
        .filter(|c| c.status == CrawlStatus::Success)
        .count();
    let failed = companies
        .iter()
        .filter(|c| c.status == CrawlStatus::Failed)
        .count();
    if succeeded == companies.len() {
        CrawlStatus::Success
    } else if failed == companies.len() {
        CrawlStatus::Failed
    } else {
        CrawlStatus::Partial
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlerStatus {
    pub is_running: bool,
    pub current_job: Option<JobSnapshot>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

/// Owner of the published job state. Readers get clones through [`JobBoard::subscribe`].
#[derive(Debug)]
pub struct JobBoard {
    tx: watch::Sender<CrawlerStatus>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CrawlerStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> CrawlerStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CrawlerStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn begin_job(&self, job: JobSnapshot) {
        self.tx.send_modify(|state| {
            state.is_running = true;
            state.current_job = Some(job);
        });
    }

    pub(crate) fn set_next_scheduled_at(&self, at: Option<DateTime<Utc>>) {
        self.tx.send_if_modified(|state| {
            let changed = state.next_scheduled_at != at;
            state.next_scheduled_at = at;
            changed
        });
    }

    pub(crate) fn set_last_run_at(&self, at: Option<DateTime<Utc>>) {
        self.tx.send_if_modified(|state| {
            if state.last_run_at.is_some() || at.is_none() {
                return false;
            }
            state.last_run_at = at;
            true
        });
    }

    pub(crate) fn request_cancel(&self, job_id: Uuid) {
        self.tx.send_if_modified(|state| match state.current_job.as_mut() {
            Some(job) if job.job_id == job_id && !job.status.is_terminal() => {
                job.cancel_requested = true;
                true
            }
            _ => false,
        });
    }

    /// Applies `change` to one company run of the current job, after checking any status move.
    pub(crate) fn update_company(
        &self,
        job_id: Uuid,
        company_id: i64,
        next_status: Option<CrawlStatus>,
        change: impl FnOnce(&mut CompanyRun),
    ) -> Result<CompanyRun, JobStateError> {
        let mut outcome = Err(JobStateError::StaleJob(job_id));
        self.tx.send_modify(|state| {
            let Some(job) = state.current_job.as_mut().filter(|j| j.job_id == job_id) else {
                return;
            };
            let Some(run) = job.companies.iter_mut().find(|c| c.company_id == company_id) else {
                outcome = Err(JobStateError::UnknownCompany(company_id));
                return;
            };
            if let Some(to) = next_status {
                if let Err(err) = check_transition(&run.company_code, run.status, to) {
                    outcome = Err(err);
                    return;
                }
                run.status = to;
            }
            change(run);
            outcome = Ok(run.clone());
        });
        outcome
    }

    /// Moves the job to `status` and clears the running flag.
    pub(crate) fn finish_job(&self, job_id: Uuid, status: CrawlStatus) -> Result<JobSnapshot, JobStateError> {
        let mut outcome = Err(JobStateError::StaleJob(job_id));
        self.tx.send_modify(|state| {
            let Some(job) = state.current_job.as_mut().filter(|j| j.job_id == job_id) else {
                return;
            };
            outcome = check_transition("job", job.status, status).map(|()| {
                let now = Utc::now();
                job.status = status;
                job.finished_at = Some(now);
                state.is_running = false;
                state.last_run_at = Some(now);
                job.clone()
            });
        });
        outcome
    }

    /// Fails whatever is still open in the job. Used when the supervisor dies or breaks an invariant.
    /// Returns `false` when the job is not on the board or already terminal.
    pub(crate) fn abort_job(&self, job_id: Uuid, reason: &str) -> bool {
        self.tx.send_if_modified(|state| {
            let Some(job) = state.current_job.as_mut().filter(|j| j.job_id == job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            let now = Utc::now();
            for run in job.companies.iter_mut().filter(|c| !c.status.is_terminal()) {
                run.status = CrawlStatus::Failed;
                run.error.get_or_insert_with(|| reason.to_string());
                run.finished_at = Some(now);
            }
            job.status = CrawlStatus::Failed;
            job.finished_at = Some(now);
            state.is_running = false;
            state.last_run_at = Some(now);
            true
        })
    }

    /// Wakes subscribers without changing state, so waiters re-check the run slot.
    pub(crate) fn wake(&self) {
        self.tx.send_modify(|_| {});
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveRun {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
}

/// The single-flight slot: holds the active run, if any.
pub(crate) type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

/// Owns the single-flight slot for one job. Dropping it without [`RunGuard::complete`]
/// releases the slot and fails the job on the board.
#[derive(Debug)]
pub(crate) struct RunGuard {
    slot: RunSlot,
    board: Arc<JobBoard>,
    job_id: Uuid,
    completed: bool,
}

impl RunGuard {
    /// Claims the slot, or returns the job already holding it.
    pub fn acquire(
        slot: &RunSlot,
        board: &Arc<JobBoard>,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<Self, Uuid> {
        let mut active = slot.lock();
        if let Some(run) = active.as_ref() {
            return Err(run.job_id);
        }
        *active = Some(ActiveRun { job_id, cancel });
        Ok(Self {
            slot: slot.clone(),
            board: board.clone(),
            job_id,
            completed: false,
        })
    }

    /// Frees the slot, then publishes the terminal job state.
    pub fn complete(mut self, status: CrawlStatus) -> Result<JobSnapshot, JobStateError> {
        self.release();
        self.completed = true;
        self.board.finish_job(self.job_id, status)
    }

    /// Frees the slot and fails the job with `reason`.
    pub fn fail(mut self, reason: &str) {
        self.release();
        self.completed = true;
        if !self.board.abort_job(self.job_id, reason) {
            self.board.wake();
        }
    }

    fn release(&self) {
        let mut active = self.slot.lock();
        if active.as_ref().is_some_and(|run| run.job_id == self.job_id) {
            *active = None;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.release();
        if std::thread::panicking() {
            error!(job_id = %self.job_id, "crawl supervisor panicked; job marked failed");
        }
        // a job that never reached the board still has waiters parked on the slot
        if !self.board.abort_job(self.job_id, "crawl supervisor stopped before the job finished") {
            self.board.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: CrawlStatus) -> CompanyRun {
        CompanyRun {
            status,
            ..CompanyRun::pending(1, "tepco", "東京電力", None)
        }
    }

    fn job(job_id: Uuid, companies: Vec<CompanyRun>) -> JobSnapshot {
        JobSnapshot {
            job_id,
            status: CrawlStatus::Running,
            trigger: TriggerType::Manual,
            force: false,
            crawl_log_id: None,
            companies,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    #[test]
    fn derived_status_rules() {
        use CrawlStatus::*;
        assert_eq!(derive_status(&[run(Success), run(Running)], false), Running);
        assert_eq!(derive_status(&[run(Success), run(Success)], false), Success);
        assert_eq!(derive_status(&[run(Failed), run(Failed)], false), Failed);
        assert_eq!(derive_status(&[run(Failed), run(Success)], false), Partial);
        assert_eq!(derive_status(&[run(Cancelled), run(Success)], false), Partial);
        assert_eq!(derive_status(&[run(Cancelled), run(Success)], true), Cancelled);
        assert_eq!(derive_status(&[run(Pending)], true), Running);
    }

    #[test]
    fn transitions_only_move_forward() {
        use CrawlStatus::*;
        assert!(check_transition("job", Pending, Running).is_ok());
        assert!(check_transition("job", Running, Partial).is_ok());
        assert_eq!(
            check_transition("tepco", Success, Running),
            Err(JobStateError::IllegalTransition {
                scope: "tepco".into(),
                from: Success,
                to: Running,
            })
        );
        assert!(check_transition("job", Running, Pending).is_err());
    }

    #[test]
    fn board_rejects_illegal_company_moves() {
        let board = JobBoard::new();
        let job_id = Uuid::new_v4();
        board.begin_job(job(job_id, vec![run(CrawlStatus::Pending)]));

        board
            .update_company(job_id, 1, Some(CrawlStatus::Running), |_| {})
            .expect("pending -> running");
        let updated = board
            .update_company(job_id, 1, Some(CrawlStatus::Success), |r| r.plans_found = 3)
            .expect("running -> success");
        assert_eq!(updated.plans_found, 3);
        assert!(board
            .update_company(job_id, 1, Some(CrawlStatus::Failed), |_| {})
            .is_err());
        assert_eq!(
            board.update_company(job_id, 9, None, |_| {}),
            Err(JobStateError::UnknownCompany(9))
        );
        let stale = Uuid::new_v4();
        assert_eq!(
            board.update_company(stale, 1, None, |_| {}),
            Err(JobStateError::StaleJob(stale))
        );
    }

    #[test]
    fn guard_is_single_flight_and_releases_on_drop() {
        let slot: RunSlot = Arc::new(Mutex::new(None));
        let board = Arc::new(JobBoard::new());
        let first = Uuid::new_v4();
        board.begin_job(job(first, vec![run(CrawlStatus::Running)]));

        let guard = RunGuard::acquire(&slot, &board, first, CancellationToken::new()).expect("free slot");
        assert_eq!(
            RunGuard::acquire(&slot, &board, Uuid::new_v4(), CancellationToken::new()).err(),
            Some(first)
        );

        drop(guard);
        let state = board.snapshot();
        assert!(!state.is_running);
        let current = state.current_job.expect("job kept visible");
        assert_eq!(current.status, CrawlStatus::Failed);
        assert_eq!(current.companies[0].status, CrawlStatus::Failed);
        assert!(RunGuard::acquire(&slot, &board, Uuid::new_v4(), CancellationToken::new()).is_ok());
    }

    #[test]
    fn completing_frees_the_slot_before_publishing() {
        let slot: RunSlot = Arc::new(Mutex::new(None));
        let board = Arc::new(JobBoard::new());
        let job_id = Uuid::new_v4();
        board.begin_job(job(job_id, vec![run(CrawlStatus::Success)]));
        let guard = RunGuard::acquire(&slot, &board, job_id, CancellationToken::new()).expect("free slot");

        let mut rx = board.subscribe();
        let finished = guard.complete(CrawlStatus::Success).expect("running -> success");
        assert_eq!(finished.status, CrawlStatus::Success);
        assert!(rx.has_changed().unwrap_or(false));
        assert!(slot.lock().is_none());
        assert!(board.snapshot().last_run_at.is_some());
    }

    #[test]
    fn dropping_an_unpublished_guard_wakes_waiters() {
        let slot: RunSlot = Arc::new(Mutex::new(None));
        let board = Arc::new(JobBoard::new());
        let guard = RunGuard::acquire(&slot, &board, Uuid::new_v4(), CancellationToken::new()).expect("free slot");

        let mut rx = board.subscribe();
        drop(guard);
        assert!(rx.has_changed().unwrap_or(false));
        assert!(board.snapshot().current_job.is_none());
        assert!(slot.lock().is_none());
    }
}
