use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jppc_adapters::CrawlerRegistry;
use jppc_core::CrawlStatus;
use jppc_storage::{HttpFetcher, MemoryStore, PgStore, RateLimiter, Store};
use jppc_sync::{
    load_companies, prune_crawl_logs, seed_companies, AppConfig, CrawlOrchestrator, JobBoard,
    JobSnapshot, ScheduleEngine, StartRequest, TracingNotifier,
};
use jppc_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jppc-cli")]
#[command(about = "Japan Power Price Crawler command-line interface")]
struct Cli {
    /// Keep everything in memory (companies seeded from the companies file) instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl job to completion and print a summary.
    Crawl {
        /// Company code to crawl; repeat for several. Defaults to every active company.
        #[arg(long = "company")]
        companies: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Serve the API and run the weekly scheduler.
    Serve,
    Migrate,
    /// Upsert companies from the companies file.
    Seed,
    /// Delete crawl logs older than the retention window.
    PruneLogs {
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    init_tracing(config.log_json);

    match cli.command.unwrap_or(Commands::Crawl {
        companies: Vec::new(),
        force: false,
    }) {
        Commands::Crawl { companies, force } => {
            let store = open_store(&config, cli.memory).await?;
            let orchestrator = build_orchestrator(&config, store.clone())?;
            let company_ids = resolve_codes(store.as_ref(), &companies).await?;
            let job = run_crawl(&orchestrator, StartRequest::manual(company_ids, force)).await?;
            print_summary(&job);
            if job.status == CrawlStatus::Failed {
                bail!("crawl job {} failed", job.job_id);
            }
        }
        Commands::Serve => {
            let store = open_store(&config, cli.memory).await?;
            let orchestrator = build_orchestrator(&config, store.clone())?;
            orchestrator.restore_last_run().await?;
            let schedule = Arc::new(ScheduleEngine::new(orchestrator.clone(), config.schedule));
            // update() only arms a started engine
            schedule.start().await?;
            let state = AppState::new(store, orchestrator.clone(), schedule.clone());
            jppc_web::serve(state, config.web_port, shutdown_signal()).await?;

            if orchestrator.stop().await {
                info!("running crawl cancelled on shutdown");
            }
            schedule.shutdown().await?;
        }
        Commands::Migrate => {
            if cli.memory {
                bail!("migrate needs a database; drop --memory");
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed => {
            let store = open_store(&config, cli.memory).await?;
            let companies = load_companies(&config.companies_file).await?;
            let written = seed_companies(store.as_ref(), &companies).await?;
            println!("seeded {written} companies from {}", config.companies_file.display());
        }
        Commands::PruneLogs { days } => {
            let store = open_store(&config, cli.memory).await?;
            let days = days.unwrap_or(config.log_retention_days);
            let removed = prune_crawl_logs(store.as_ref(), days, Utc::now()).await?;
            println!("removed {removed} crawl logs older than {days} days");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,jppc=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn open_store(config: &AppConfig, memory: bool) -> Result<Arc<dyn Store>> {
    if memory {
        let store = MemoryStore::new();
        let companies = load_companies(&config.companies_file).await?;
        seed_companies(&store, &companies).await?;
        return Ok(Arc::new(store));
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn build_orchestrator(config: &AppConfig, store: Arc<dyn Store>) -> Result<CrawlOrchestrator> {
    let http = Arc::new(HttpFetcher::new(config.http_client())?);
    Ok(CrawlOrchestrator::new(
        store,
        CrawlerRegistry::builtin(http),
        Arc::new(RateLimiter::new(config.rate_limits())),
        Arc::new(TracingNotifier),
        Arc::new(JobBoard::new()),
        config.orchestrator_settings(),
    ))
}

async fn resolve_codes(store: &dyn Store, codes: &[String]) -> Result<Option<Vec<i64>>> {
    if codes.is_empty() {
        return Ok(None);
    }
    let mut ids = Vec::with_capacity(codes.len());
    for code in codes {
        match store.company_by_code(code).await? {
            Some(company) => ids.push(company.id),
            None => bail!("unknown company code `{code}`"),
        }
    }
    Ok(Some(ids))
}

/// Starts a job and waits for it; Ctrl-C cancels it.
async fn run_crawl(orchestrator: &CrawlOrchestrator, request: StartRequest) -> Result<JobSnapshot> {
    let started = orchestrator.start(request).await?;
    info!(job_id = %started.job_id, companies = ?started.companies, "crawl started");
    let finished = tokio::select! {
        finished = orchestrator.wait_for(started.job_id) => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling crawl");
            orchestrator.stop().await;
            orchestrator.status().current_job.filter(|job| job.job_id == started.job_id)
        }
    };
    finished.with_context(|| format!("crawl job {} left no final state", started.job_id))
}

fn print_summary(job: &JobSnapshot) {
    let (found, created, updated) = job.totals();
    println!(
        "crawl complete: job_id={} status={} found={} created={} updated={}",
        job.job_id, job.status, found, created, updated
    );
    for run in &job.companies {
        match &run.error {
            Some(error) => println!("  {:<8} {:<9} {}", run.company_code, run.status.as_str(), error),
            None => println!(
                "  {:<8} {:<9} found={} created={} updated={}",
                run.company_code, run.status.as_str(), run.plans_found, run.plans_created, run.plans_updated
            ),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
