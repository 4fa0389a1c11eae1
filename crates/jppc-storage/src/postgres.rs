//! Postgres implementation of the repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jppc_core::{
    AlertKind, AlertRecipient, AlertSetting, Company, CrawlLog, CrawlLogFilter, CrawlLogUpdate,
    NewCompany, NewCrawlLog, NewPriceHistory, NewPricePlan, Page, PriceHistory, PricePlan,
    PriceTier, Tariff,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use crate::repository::{
    page_offset, AlertRepository, CompanyRepository, CrawlLogRepository, PlanRepository,
    PlanTransaction, RepoResult, RepositoryError,
};

const COMPANY_COLUMNS: &str = "id, code, name_ja, name_en, name_ko, website_url, price_page_url, \
     region, description, is_active, created_at, updated_at";

const PLAN_COLUMNS: &str = "id, company_id, plan_code, plan_name_ja, plan_name_en, plan_type, \
     contract_type, base_charge, unit_price, price_tiers, fuel_adjustment, renewable_surcharge, \
     minimum_charge, time_of_use, effective_date, source_url, raw_data, is_current, created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, price_plan_id, company_id, plan_code, field_name, old_value, \
     new_value, change_kind, change_details, changed_at";

const LOG_COLUMNS: &str = "l.id, l.company_id, c.name_ja AS company_name, l.status, \
     l.trigger_type, l.started_at, l.finished_at, l.duration_seconds, l.plans_found, \
     l.plans_created, l.plans_updated, l.error_message, l.error_details";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> RepoResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_write_err(err: sqlx::Error) -> RepositoryError {
    let is_unique_violation = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505");
    if is_unique_violation {
        RepositoryError::Constraint(err.to_string())
    } else {
        RepositoryError::Database(err)
    }
}

fn company_from_row(row: &PgRow) -> RepoResult<Company> {
    Ok(Company {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name_ja: row.try_get("name_ja")?,
        name_en: row.try_get("name_en")?,
        name_ko: row.try_get("name_ko")?,
        website_url: row.try_get("website_url")?,
        price_page_url: row.try_get("price_page_url")?,
        region: row.try_get("region")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plan_from_row(row: &PgRow) -> RepoResult<PricePlan> {
    let plan_type: String = row.try_get("plan_type")?;
    let tiers: Json<Vec<PriceTier>> = row.try_get("price_tiers")?;
    Ok(PricePlan {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        plan_code: row.try_get("plan_code")?,
        plan_name_ja: row.try_get("plan_name_ja")?,
        plan_name_en: row.try_get("plan_name_en")?,
        plan_type: plan_type.parse()?,
        contract_type: row.try_get("contract_type")?,
        tariff: Tariff {
            base_charge: row.try_get("base_charge")?,
            unit_price: row.try_get("unit_price")?,
            price_tiers: tiers.0,
            fuel_adjustment: row.try_get("fuel_adjustment")?,
            renewable_surcharge: row.try_get("renewable_surcharge")?,
            minimum_charge: row.try_get("minimum_charge")?,
            time_of_use: row.try_get("time_of_use")?,
        },
        effective_date: row.try_get("effective_date")?,
        source_url: row.try_get("source_url")?,
        raw_data: row.try_get("raw_data")?,
        is_current: row.try_get("is_current")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> RepoResult<PriceHistory> {
    let kind: String = row.try_get("change_kind")?;
    Ok(PriceHistory {
        id: row.try_get("id")?,
        price_plan_id: row.try_get("price_plan_id")?,
        company_id: row.try_get("company_id")?,
        plan_code: row.try_get("plan_code")?,
        field_name: row.try_get("field_name")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        change_kind: kind.parse()?,
        change_details: row.try_get("change_details")?,
        changed_at: row.try_get("changed_at")?,
    })
}

fn log_from_row(row: &PgRow) -> RepoResult<CrawlLog> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger_type")?;
    Ok(CrawlLog {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        company_name: row.try_get("company_name")?,
        status: status.parse()?,
        trigger_type: trigger.parse()?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        plans_found: row.try_get("plans_found")?,
        plans_created: row.try_get("plans_created")?,
        plans_updated: row.try_get("plans_updated")?,
        error_message: row.try_get("error_message")?,
        error_details: row.try_get("error_details")?,
    })
}

#[async_trait]
impl CompanyRepository for PgStore {
    async fn list_companies(&self, active_only: bool) -> RepoResult<Vec<Company>> {
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE ($1 = FALSE OR is_active) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn companies_by_ids(&self, ids: &[i64]) -> RepoResult<Vec<Company>> {
        let sql = format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ANY($1) ORDER BY id");
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn company_by_code(&self, code: &str) -> RepoResult<Option<Company>> {
        let sql = format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE code = $1");
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn upsert_company(&self, company: &NewCompany) -> RepoResult<Company> {
        let sql = format!(
            r#"
            INSERT INTO companies
                (code, name_ja, name_en, name_ko, website_url, price_page_url, region, description, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (code) DO UPDATE SET
                name_ja = EXCLUDED.name_ja,
                name_en = EXCLUDED.name_en,
                name_ko = EXCLUDED.name_ko,
                website_url = EXCLUDED.website_url,
                price_page_url = EXCLUDED.price_page_url,
                region = EXCLUDED.region,
                description = EXCLUDED.description,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            RETURNING {COMPANY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&company.code)
            .bind(&company.name_ja)
            .bind(&company.name_en)
            .bind(&company.name_ko)
            .bind(&company.website_url)
            .bind(&company.price_page_url)
            .bind(&company.region)
            .bind(&company.description)
            .bind(company.is_active)
            .fetch_one(&self.pool)
            .await
            .map_err(map_write_err)?;
        company_from_row(&row)
    }
}

pub struct PgPlanTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PlanTransaction for PgPlanTransaction {
    async fn current_plan(
        &mut self,
        company_id: i64,
        plan_code: &str,
    ) -> RepoResult<Option<PricePlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM price_plans \
             WHERE company_id = $1 AND plan_code = $2 AND is_current FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(company_id)
            .bind(plan_code)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn insert_plan(&mut self, plan: &NewPricePlan) -> RepoResult<PricePlan> {
        let sql = format!(
            r#"
            INSERT INTO price_plans
                (company_id, plan_code, plan_name_ja, plan_name_en, plan_type, contract_type,
                 base_charge, unit_price, price_tiers, fuel_adjustment, renewable_surcharge,
                 minimum_charge, time_of_use, effective_date, source_url, raw_data, is_current)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, TRUE)
            RETURNING {PLAN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(plan.company_id)
            .bind(&plan.plan_code)
            .bind(&plan.plan_name_ja)
            .bind(&plan.plan_name_en)
            .bind(plan.plan_type.as_str())
            .bind(&plan.contract_type)
            .bind(plan.tariff.base_charge)
            .bind(plan.tariff.unit_price)
            .bind(Json(&plan.tariff.price_tiers))
            .bind(plan.tariff.fuel_adjustment)
            .bind(plan.tariff.renewable_surcharge)
            .bind(plan.tariff.minimum_charge)
            .bind(&plan.tariff.time_of_use)
            .bind(plan.effective_date)
            .bind(&plan.source_url)
            .bind(&plan.raw_data)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_write_err)?;
        plan_from_row(&row)
    }

    async fn mark_superseded(&mut self, plan_id: i64) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE price_plans SET is_current = FALSE, updated_at = NOW() WHERE id = $1 AND is_current",
        )
        .bind(plan_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("current price plan {plan_id}")));
        }
        Ok(())
    }

    async fn insert_history(&mut self, entry: &NewPriceHistory) -> RepoResult<PriceHistory> {
        let sql = format!(
            r#"
            INSERT INTO price_history
                (price_plan_id, company_id, plan_code, field_name, old_value, new_value,
                 change_kind, change_details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {HISTORY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(entry.price_plan_id)
            .bind(entry.company_id)
            .bind(&entry.plan_code)
            .bind(&entry.field_name)
            .bind(&entry.old_value)
            .bind(&entry.new_value)
            .bind(entry.change_kind.as_str())
            .bind(&entry.change_details)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_write_err)?;
        history_from_row(&row)
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        self.tx.commit().await.map_err(map_write_err)
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl PlanRepository for PgStore {
    async fn begin_plan_write(&self) -> RepoResult<Box<dyn PlanTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgPlanTransaction { tx }))
    }

    async fn current_plans(&self, company_id: Option<i64>) -> RepoResult<Vec<PricePlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM price_plans \
             WHERE is_current AND ($1::BIGINT IS NULL OR company_id = $1) \
             ORDER BY company_id, plan_code"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(plan_from_row).collect()
    }

    async fn plan_lineage(&self, company_id: i64, plan_code: &str) -> RepoResult<Vec<PricePlan>> {
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM price_plans WHERE company_id = $1 AND plan_code = $2 \
             ORDER BY effective_date DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .bind(plan_code)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(plan_from_row).collect()
    }

    async fn plan_history(
        &self,
        company_id: i64,
        plan_code: &str,
    ) -> RepoResult<Vec<PriceHistory>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM price_history WHERE company_id = $1 AND plan_code = $2 \
             ORDER BY changed_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .bind(plan_code)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }
}

#[async_trait]
impl CrawlLogRepository for PgStore {
    async fn create_crawl_log(&self, log: &NewCrawlLog) -> RepoResult<CrawlLog> {
        let row = sqlx::query(
            r#"
            INSERT INTO crawl_logs (company_id, status, trigger_type, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(log.company_id)
        .bind(log.status.as_str())
        .bind(log.trigger_type.as_str())
        .bind(log.started_at)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        self.get_crawl_log(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("crawl log {id}")))
    }

    async fn update_crawl_log(&self, id: i64, update: &CrawlLogUpdate) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_logs SET
                status = COALESCE($2, status),
                finished_at = COALESCE($3, finished_at),
                duration_seconds = CASE
                    WHEN $3::TIMESTAMPTZ IS NULL THEN duration_seconds
                    ELSE EXTRACT(EPOCH FROM ($3::TIMESTAMPTZ - started_at))::BIGINT
                END,
                plans_found = COALESCE($4, plans_found),
                plans_created = COALESCE($5, plans_created),
                plans_updated = COALESCE($6, plans_updated),
                error_message = COALESCE($7, error_message),
                error_details = COALESCE($8, error_details)
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.finished_at)
        .bind(update.plans_found)
        .bind(update.plans_created)
        .bind(update.plans_updated)
        .bind(&update.error_message)
        .bind(&update.error_details)
        .execute(&self.pool)
        .await?;
        let changed = result.rows_affected() > 0;
        if !changed {
            debug!(crawl_log_id = id, "crawl log already terminal; update skipped");
        }
        Ok(changed)
    }

    async fn get_crawl_log(&self, id: i64) -> RepoResult<Option<CrawlLog>> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM crawl_logs l LEFT JOIN companies c ON c.id = l.company_id \
             WHERE l.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn list_crawl_logs(
        &self,
        filter: &CrawlLogFilter,
        page: u32,
        page_size: u32,
    ) -> RepoResult<Page<CrawlLog>> {
        let status = filter.status.map(|s| s.as_str());
        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM crawl_logs
            WHERE ($1::BIGINT IS NULL OR company_id = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            "#,
        )
        .bind(filter.company_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM crawl_logs l LEFT JOIN companies c ON c.id = l.company_id \
             WHERE ($1::BIGINT IS NULL OR l.company_id = $1) \
               AND ($2::TEXT IS NULL OR l.status = $2) \
             ORDER BY l.started_at DESC, l.id DESC \
             LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.company_id)
            .bind(status)
            .bind(i64::from(page_size))
            .bind(page_offset(page, page_size))
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(log_from_row).collect::<RepoResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn last_success_at(&self, company_id: Option<i64>) -> RepoResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(finished_at) AS last_success FROM crawl_logs
            WHERE status = 'success' AND company_id IS NOT DISTINCT FROM $1
            "#,
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_success")?)
    }

    async fn purge_crawl_logs_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let result = sqlx::query(
            "DELETE FROM crawl_logs WHERE started_at < $1 AND status NOT IN ('pending', 'running')",
        )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn alert_setting(&self, kind: AlertKind) -> RepoResult<Option<AlertSetting>> {
        let row = sqlx::query("SELECT id, alert_type, is_enabled FROM alert_settings WHERE alert_type = $1")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> RepoResult<AlertSetting> {
            let alert_type: String = row.try_get("alert_type")?;
            Ok(AlertSetting {
                id: row.try_get("id")?,
                alert_type: alert_type.parse()?,
                is_enabled: row.try_get("is_enabled")?,
            })
        })
        .transpose()
    }

    async fn alert_recipients(&self, kind: AlertKind) -> RepoResult<Vec<AlertRecipient>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.alert_setting_id, r.email, r.name, r.is_active
            FROM alert_recipients r
            JOIN alert_settings s ON s.id = r.alert_setting_id
            WHERE s.alert_type = $1 AND r.is_active
            ORDER BY r.id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> RepoResult<AlertRecipient> {
                Ok(AlertRecipient {
                    id: row.try_get("id")?,
                    alert_setting_id: row.try_get("alert_setting_id")?,
                    email: row.try_get("email")?,
                    name: row.try_get("name")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }
}
