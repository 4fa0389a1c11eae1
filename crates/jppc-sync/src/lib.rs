//! Crawl orchestration for JPPC: reconciliation, job state, scheduling, alerts and bill estimates.

pub mod alerts;
pub mod config;
pub mod housekeeping;
pub mod job;
pub mod orchestrator;
pub mod pricing;
pub mod reconcile;
pub mod schedule;

pub use alerts::{dispatch, NoopNotifier, Notifier, TracingNotifier};
pub use config::AppConfig;
pub use housekeeping::{load_companies, prune_crawl_logs, seed_companies, CompaniesFile};
pub use job::{derive_status, CompanyRun, CrawlerStatus, JobBoard, JobSnapshot, JobStateError};
pub use orchestrator::{
    CrawlOrchestrator, OrchestratorError, OrchestratorSettings, StartRequest, StartedJob,
};
pub use pricing::{compare_plans, monthly_bill, PlanEstimate, DEFAULT_USAGE_KWH};
pub use reconcile::{FieldChange, ReconcileAction, ReconcileResult, Reconciler};
pub use schedule::{next_run, Schedule, ScheduleEngine, ScheduleError, JST};

pub const CRATE_NAME: &str = "jppc-sync";
