//! Weekly crawl schedule, kept in Japan time.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::orchestrator::{CrawlOrchestrator, OrchestratorError, StartRequest};

/// Asia/Tokyo has no daylight saving time.
pub const JST: FixedOffset = match FixedOffset::east_opt(9 * 3600) {
    Some(offset) => offset,
    None => panic!("invalid JST offset"),
};

const MINUTES_PER_WEEK: i64 = 7 * 24 * 60;
const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

pub fn jst_today(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&JST).date_naive()
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    Invalid(String),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// Weekly run time. `day_of_week` counts from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub is_enabled: bool,
    pub day_of_week: u8,
    pub hour: u8,
    pub minute: u8,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            is_enabled: false,
            day_of_week: 0,
            hour: 2,
            minute: 0,
        }
    }
}

impl Schedule {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.day_of_week > 6 {
            return Err(ScheduleError::Invalid(format!(
                "day_of_week must be 0-6, got {}",
                self.day_of_week
            )));
        }
        if self.hour > 23 {
            return Err(ScheduleError::Invalid(format!("hour must be 0-23, got {}", self.hour)));
        }
        if self.minute > 59 {
            return Err(ScheduleError::Invalid(format!(
                "minute must be 0-59, got {}",
                self.minute
            )));
        }
        Ok(())
    }

    /// Six-field cron expression (seconds first) for the same instant in UTC.
    pub fn utc_cron(&self) -> String {
        let jst_minutes =
            i64::from(self.day_of_week) * 1440 + i64::from(self.hour) * 60 + i64::from(self.minute);
        let offset_minutes = i64::from(JST.local_minus_utc() / 60);
        let utc_minutes = (jst_minutes - offset_minutes).rem_euclid(MINUTES_PER_WEEK);
        let day = DAY_NAMES[(utc_minutes / 1440) as usize];
        let hour = (utc_minutes % 1440) / 60;
        let minute = utc_minutes % 60;
        format!("0 {minute} {hour} * * {day}")
    }
}

/// First scheduled instant strictly after `after`, or `None` when disabled.
pub fn next_run(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !schedule.is_enabled || schedule.validate().is_err() {
        return None;
    }
    let local = after.with_timezone(&JST);
    let today = local.weekday().num_days_from_monday();
    let days_ahead = (7 + u32::from(schedule.day_of_week) - today) % 7;
    let date = local.date_naive().checked_add_days(Days::new(u64::from(days_ahead)))?;
    let time = NaiveTime::from_hms_opt(u32::from(schedule.hour), u32::from(schedule.minute), 0)?;
    let mut candidate = JST.from_local_datetime(&date.and_time(time)).single()?;
    if candidate <= local {
        candidate += chrono::Duration::days(7);
    }
    Some(candidate.with_timezone(&Utc))
}

struct Armed {
    scheduler: JobScheduler,
    job: Option<Uuid>,
}

/// Starts a scheduled crawl of every active company at the configured weekly time.
/// The schedule lives in memory; a restart falls back to the configured default.
pub struct ScheduleEngine {
    orchestrator: CrawlOrchestrator,
    schedule: parking_lot::Mutex<Schedule>,
    armed: Mutex<Option<Armed>>,
}

impl ScheduleEngine {
    pub fn new(orchestrator: CrawlOrchestrator, schedule: Schedule) -> Self {
        orchestrator.publish_next_run(next_run(&schedule, Utc::now()));
        Self {
            orchestrator,
            schedule: parking_lot::Mutex::new(schedule),
            armed: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Schedule {
        *self.schedule.lock()
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        next_run(&self.current(), Utc::now())
    }

    pub async fn start(&self) -> Result<(), ScheduleError> {
        let mut armed = self.armed.lock().await;
        if armed.is_some() {
            return Ok(());
        }
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        let mut state = Armed {
            scheduler,
            job: None,
        };
        self.arm(&mut state, self.current()).await?;
        *armed = Some(state);
        Ok(())
    }

    pub async fn update(&self, schedule: Schedule) -> Result<Schedule, ScheduleError> {
        schedule.validate()?;
        let mut armed = self.armed.lock().await;
        if let Some(state) = armed.as_mut() {
            self.arm(state, schedule).await?;
        }
        *self.schedule.lock() = schedule;
        self.orchestrator.publish_next_run(next_run(&schedule, Utc::now()));
        info!(
            enabled = schedule.is_enabled,
            day_of_week = schedule.day_of_week,
            hour = schedule.hour,
            minute = schedule.minute,
            "crawl schedule updated"
        );
        Ok(schedule)
    }

    pub async fn shutdown(&self) -> Result<(), ScheduleError> {
        if let Some(mut state) = self.armed.lock().await.take() {
            state.scheduler.shutdown().await?;
        }
        Ok(())
    }

    async fn arm(&self, state: &mut Armed, schedule: Schedule) -> Result<(), ScheduleError> {
        if let Some(previous) = state.job.take() {
            state.scheduler.remove(&previous).await?;
        }
        if !schedule.is_enabled {
            return Ok(());
        }

        let cron = schedule.utc_cron();
        let orchestrator = self.orchestrator.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _scheduler| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.start(StartRequest::scheduled()).await {
                    Ok(started) => info!(
                        job_id = %started.job_id,
                        companies = started.companies.len(),
                        "scheduled crawl started"
                    ),
                    Err(OrchestratorError::AlreadyRunning(job_id)) => {
                        warn!(%job_id, "scheduled crawl skipped, a job is already running")
                    }
                    Err(err) => error!(error = %err, "scheduled crawl did not start"),
                }
                orchestrator.publish_next_run(next_run(&schedule, Utc::now()));
            })
        })?;
        state.job = Some(state.scheduler.add(job).await?);
        info!(%cron, "crawl schedule armed");
        Ok(())
    }
}
