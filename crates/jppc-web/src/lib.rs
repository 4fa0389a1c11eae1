//! Axum JSON API for JPPC: crawl control, crawl logs, the weekly schedule and price reads.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jppc_core::{CrawlLog, CrawlLogFilter, CrawlStatus, Page, PriceHistory, PricePlan};
use jppc_storage::{RepositoryError, Store};
use jppc_sync::{
    compare_plans, CrawlOrchestrator, JobSnapshot, OrchestratorError, PlanEstimate, Schedule,
    ScheduleEngine, ScheduleError, StartRequest, StartedJob, DEFAULT_USAGE_KWH,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jppc-web";

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: CrawlOrchestrator,
    pub schedule: Arc<ScheduleEngine>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, orchestrator: CrawlOrchestrator, schedule: Arc<ScheduleEngine>) -> Self {
        Self {
            store,
            orchestrator,
            schedule,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict { message: String, job_id: Option<Uuid> },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{0}")]
    Internal(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::AlreadyRunning(job_id) => ApiError::Conflict {
                message: err.to_string(),
                job_id: Some(job_id),
            },
            OrchestratorError::RecentlyCrawled(_) => ApiError::Conflict {
                message: err.to_string(),
                job_id: None,
            },
            OrchestratorError::NoCompanies => ApiError::NotFound(err.to_string()),
            OrchestratorError::Repository(source) => ApiError::Repository(source),
            OrchestratorError::Aborted(message) => ApiError::Internal(message),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Invalid(message) => ApiError::Invalid(message),
            ScheduleError::Scheduler(source) => ApiError::Internal(source.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            ApiError::Invalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request"),
            ApiError::Repository(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let message = match &self {
            ApiError::Repository(_) | ApiError::Internal(_) => {
                error!(error = %self, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({ "error": code, "message": message });
        if let ApiError::Conflict {
            job_id: Some(job_id),
            ..
        } = &self
        {
            body["job_id"] = json!(job_id);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct StartBody {
    #[serde(default)]
    company_ids: Option<Vec<i64>>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_running: bool,
    current_job: Option<JobSnapshot>,
    last_run: Option<DateTime<Utc>>,
    next_scheduled_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    company_id: Option<i64>,
    status: Option<CrawlStatus>,
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    #[serde(flatten)]
    schedule: Schedule,
    timezone: &'static str,
    next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CurrentPricesQuery {
    company_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CompareQuery {
    usage_kwh: Option<f64>,
    /// Comma-separated company ids; every company when absent.
    company_ids: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompareResponse {
    usage_kwh: f64,
    cheapest_plan_id: Option<i64>,
    comparisons: Vec<PlanEstimate>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    company_id: i64,
    plan_code: String,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    company_id: i64,
    plan_code: String,
    plans: Vec<PricePlan>,
    changes: Vec<PriceHistory>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/crawling/start", post(start_handler))
        .route("/crawling/stop", post(stop_handler))
        .route("/crawling/status", get(status_handler))
        .route("/crawling/logs", get(logs_handler))
        .route("/crawling/logs/{id}", get(log_detail_handler))
        .route("/crawling/schedule", get(schedule_handler).put(update_schedule_handler))
        .route("/prices/current", get(current_prices_handler))
        .route("/prices/history", get(price_history_handler))
        .route("/prices/compare", get(compare_prices_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serves the API on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("api server")?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<StartedJob> {
    // an empty body means every active company
    let body: StartBody = if body.iter().all(u8::is_ascii_whitespace) {
        StartBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::Invalid(format!("invalid body: {err}")))?
    };
    let started = state
        .orchestrator
        .start(StartRequest::manual(body.company_ids, body.force))
        .await?;
    Ok(Json(started))
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    if !state.orchestrator.stop().await {
        info!("stop requested with no crawl running");
    }
    StatusCode::NO_CONTENT
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let status = state.orchestrator.status();
    Json(StatusResponse {
        is_running: status.is_running,
        current_job: status.current_job,
        last_run: status.last_run_at,
        next_scheduled_run: status.next_scheduled_at,
    })
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Page<CrawlLog>> {
    let page = query.page.unwrap_or(1);
    if page == 0 {
        return Err(ApiError::Invalid("page starts at 1".into()));
    }
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ApiError::Invalid(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let filter = CrawlLogFilter {
        company_id: query.company_id,
        status: query.status,
    };
    Ok(Json(state.store.list_crawl_logs(&filter, page, page_size).await?))
}

async fn log_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<CrawlLog> {
    state
        .store
        .get_crawl_log(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("crawl log {id} not found")))
}

fn schedule_view(engine: &ScheduleEngine) -> ScheduleView {
    ScheduleView {
        schedule: engine.current(),
        timezone: "Asia/Tokyo",
        next_run_at: engine.next_run_at(),
    }
}

async fn schedule_handler(State(state): State<Arc<AppState>>) -> Json<ScheduleView> {
    Json(schedule_view(&state.schedule))
}

async fn update_schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(schedule): Json<Schedule>,
) -> ApiResult<ScheduleView> {
    state.schedule.update(schedule).await?;
    Ok(Json(schedule_view(&state.schedule)))
}

async fn current_prices_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CurrentPricesQuery>,
) -> ApiResult<Vec<PricePlan>> {
    Ok(Json(state.store.current_plans(query.company_id).await?))
}

fn parse_company_ids(raw: &str) -> Result<Vec<i64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|_| ApiError::Invalid(format!("invalid company id `{part}`")))
        })
        .collect()
}

async fn compare_prices_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<CompareResponse> {
    let usage_kwh = query.usage_kwh.unwrap_or(DEFAULT_USAGE_KWH);
    if !usage_kwh.is_finite() || usage_kwh < 0.0 {
        return Err(ApiError::Invalid("usage_kwh must be a non-negative number".into()));
    }
    let company_ids = query.company_ids.as_deref().map(parse_company_ids).transpose()?;

    let mut plans = state.store.current_plans(None).await?;
    if let Some(ids) = &company_ids {
        plans.retain(|plan| ids.contains(&plan.company_id));
    }
    let comparisons = compare_plans(plans, usage_kwh);
    let cheapest_plan_id = comparisons
        .first()
        .filter(|estimate| estimate.estimated_monthly_cost.is_some())
        .map(|estimate| estimate.plan.id);
    Ok(Json(CompareResponse {
        usage_kwh,
        cheapest_plan_id,
        comparisons,
    }))
}

async fn price_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryResponse> {
    let plans = state
        .store
        .plan_lineage(query.company_id, &query.plan_code)
        .await?;
    if plans.is_empty() {
        return Err(ApiError::NotFound(format!(
            "plan {} of company {} not found",
            query.plan_code, query.company_id
        )));
    }
    let changes = state
        .store
        .plan_history(query.company_id, &query.plan_code)
        .await?;
    Ok(Json(HistoryResponse {
        company_id: query.company_id,
        plan_code: query.plan_code,
        plans,
        changes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use jppc_adapters::{CrawlContext, CrawlError, CrawlerRegistry, Vendor, VendorCrawler};
    use jppc_core::{NewCompany, PlanType, RawPlanRecord, Tariff};
    use jppc_storage::{CompanyRepository, MemoryStore, RateLimiter, RateLimiterConfig};
    use jppc_sync::{JobBoard, NoopNotifier, OrchestratorSettings};
    use serde_json::Value;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    /// Returns one TEPCO plan, optionally after being released.
    struct StubCrawler {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl VendorCrawler for StubCrawler {
        fn vendor(&self) -> Vendor {
            Vendor::Tepco
        }

        fn price_page_urls(&self) -> Vec<String> {
            Vec::new()
        }

        async fn discover_plans(&self, _ctx: &CrawlContext) -> Result<Vec<RawPlanRecord>, CrawlError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(vec![RawPlanRecord {
                plan_code: "tepco_metered_b".into(),
                plan_name_ja: "従量電灯B".into(),
                plan_name_en: None,
                plan_type: PlanType::Residential,
                contract_type: None,
                tariff: Tariff {
                    base_charge: Some(311.75),
                    unit_price: Some(29.80),
                    ..Default::default()
                },
                effective_date: NaiveDate::from_ymd_opt(2024, 4, 1),
                source_url: "https://www.tepco.co.jp/".into(),
                raw_data: Value::Null,
            }])
        }
    }

    struct TestApp {
        router: Router,
        orchestrator: CrawlOrchestrator,
        tepco_id: i64,
    }

    async fn test_app(gate: Option<Arc<Notify>>) -> TestApp {
        let store = MemoryStore::new();
        let tepco = store
            .upsert_company(&NewCompany {
                code: "tepco".into(),
                name_ja: "東京電力エナジーパートナー".into(),
                name_en: None,
                name_ko: None,
                website_url: None,
                price_page_url: None,
                region: Some("関東".into()),
                description: None,
                is_active: true,
            })
            .await
            .unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let orchestrator = CrawlOrchestrator::new(
            store.clone(),
            CrawlerRegistry::default().with(Arc::new(StubCrawler { gate })),
            Arc::new(RateLimiter::new(RateLimiterConfig::uniform(Duration::ZERO))),
            Arc::new(NoopNotifier),
            Arc::new(JobBoard::new()),
            OrchestratorSettings::default(),
        );
        let schedule = Arc::new(ScheduleEngine::new(orchestrator.clone(), Schedule::default()));
        TestApp {
            router: app(AppState::new(store, orchestrator.clone(), schedule)),
            orchestrator,
            tepco_id: tepco.id,
        }
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn run_one_job(app: &TestApp) -> Uuid {
        let (status, body) = call(&app.router, Method::POST, "/crawling/start", None).await;
        assert_eq!(status, StatusCode::OK);
        let job_id: Uuid = serde_json::from_value(body["job_id"].clone()).unwrap();
        app.orchestrator.wait_for(job_id).await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = test_app(None).await;
        let (status, body) = call(&app.router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn second_start_conflicts_while_a_job_runs() {
        let gate = Arc::new(Notify::new());
        let app = test_app(Some(gate.clone())).await;

        let (status, started) = call(&app.router, Method::POST, "/crawling/start", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["status"], "running");
        assert_eq!(started["companies"], json!(["tepco"]));

        let (status, conflict) = call(
            &app.router,
            Method::POST,
            "/crawling/start",
            Some(json!({ "force": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["job_id"], started["job_id"]);

        let (_, running) = call(&app.router, Method::GET, "/crawling/status", None).await;
        assert_eq!(running["is_running"], true);
        assert_eq!(running["current_job"]["job_id"], started["job_id"]);

        gate.notify_one();
        let job_id: Uuid = serde_json::from_value(started["job_id"].clone()).unwrap();
        app.orchestrator.wait_for(job_id).await.unwrap();

        let (_, done) = call(&app.router, Method::GET, "/crawling/status", None).await;
        assert_eq!(done["is_running"], false);
        assert_eq!(done["current_job"]["status"], "success");
        assert!(done["last_run"].is_string());
    }

    #[tokio::test]
    async fn start_with_no_matching_company_is_not_found() {
        let app = test_app(None).await;
        let (status, body) = call(
            &app.router,
            Method::POST,
            "/crawling/start",
            Some(json!({ "company_ids": [404] })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn malformed_start_body_is_rejected() {
        let app = test_app(None).await;
        let (status, _) = call(
            &app.router,
            Method::POST,
            "/crawling/start",
            Some(json!({ "company_ids": "tepco" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn stop_is_no_content_even_when_idle() {
        let app = test_app(None).await;
        let (status, body) = call(&app.router, Method::POST, "/crawling/stop", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn logs_paginate_filter_and_validate() {
        let app = test_app(None).await;
        run_one_job(&app).await;

        let (status, page) = call(&app.router, Method::GET, "/crawling/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 2);
        assert_eq!(page["page"], 1);
        assert_eq!(page["page_size"], 20);

        let uri = format!("/crawling/logs?company_id={}&status=success", app.tepco_id);
        let (_, filtered) = call(&app.router, Method::GET, &uri, None).await;
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["items"][0]["company_name"], "東京電力エナジーパートナー");
        assert_eq!(filtered["items"][0]["plans_created"], 1);

        for bad in ["page_size=0", "page_size=101", "page=0"] {
            let (status, _) = call(&app.router, Method::GET, &format!("/crawling/logs?{bad}"), None).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{bad}");
        }
        let (status, _) = call(&app.router, Method::GET, "/crawling/logs?status=exploded", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn log_detail_or_not_found() {
        let app = test_app(None).await;
        run_one_job(&app).await;

        let (_, page) = call(&app.router, Method::GET, "/crawling/logs", None).await;
        let id = page["items"][0]["id"].as_i64().unwrap();
        let (status, log) = call(&app.router, Method::GET, &format!("/crawling/logs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(log["id"], id);

        let (status, _) = call(&app.router, Method::GET, "/crawling/logs/999999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_reads_and_updates() {
        let app = test_app(None).await;
        let (status, current) = call(&app.router, Method::GET, "/crawling/schedule", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["is_enabled"], false);
        assert_eq!(current["timezone"], "Asia/Tokyo");
        assert!(current["next_run_at"].is_null());

        let (status, updated) = call(
            &app.router,
            Method::PUT,
            "/crawling/schedule",
            Some(json!({ "is_enabled": true, "day_of_week": 2, "hour": 9, "minute": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["day_of_week"], 2);
        assert!(updated["next_run_at"].is_string());

        let (_, status_body) = call(&app.router, Method::GET, "/crawling/status", None).await;
        assert_eq!(status_body["next_scheduled_run"], updated["next_run_at"]);

        let (status, _) = call(
            &app.router,
            Method::PUT,
            "/crawling/schedule",
            Some(json!({ "is_enabled": true, "day_of_week": 7, "hour": 9, "minute": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (_, unchanged) = call(&app.router, Method::GET, "/crawling/schedule", None).await;
        assert_eq!(unchanged["day_of_week"], 2);
    }

    #[tokio::test]
    async fn prices_expose_current_plans_and_lineage() {
        let app = test_app(None).await;
        run_one_job(&app).await;

        let uri = format!("/prices/current?company_id={}", app.tepco_id);
        let (status, plans) = call(&app.router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plans.as_array().map(Vec::len), Some(1));
        assert_eq!(plans[0]["plan_code"], "tepco_metered_b");
        assert_eq!(plans[0]["is_current"], true);

        let uri = format!("/prices/history?company_id={}&plan_code=tepco_metered_b", app.tepco_id);
        let (status, history) = call(&app.router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["plans"].as_array().map(Vec::len), Some(1));
        assert_eq!(history["changes"][0]["change_kind"], "initial");

        let uri = format!("/prices/history?company_id={}&plan_code=missing", app.tepco_id);
        let (status, _) = call(&app.router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compare_ranks_current_plans_by_estimated_bill() {
        let app = test_app(None).await;
        run_one_job(&app).await;

        let uri = format!("/prices/compare?usage_kwh=300&company_ids={}", app.tepco_id);
        let (status, body) = call(&app.router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage_kwh"], 300.0);
        assert_eq!(body["comparisons"].as_array().map(Vec::len), Some(1));
        let estimate = &body["comparisons"][0];
        assert_eq!(estimate["plan_code"], "tepco_metered_b");
        // 311.75 + 300 * 29.80
        assert_eq!(estimate["estimated_monthly_cost"], 9251.75);
        assert_eq!(body["cheapest_plan_id"], estimate["id"]);

        let (status, other) = call(&app.router, Method::GET, "/prices/compare?company_ids=999", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(other["usage_kwh"], 300.0);
        assert_eq!(other["comparisons"], json!([]));
        assert!(other["cheapest_plan_id"].is_null());

        for bad in ["usage_kwh=-1", "company_ids=1,tepco"] {
            let (status, _) = call(&app.router, Method::GET, &format!("/prices/compare?{bad}"), None).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{bad}");
        }
    }
}
