//! Core domain model for JPPC: companies, tariff plans, price history and crawl logs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "jppc-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a snake_case text enum with `as_str`, `Display` and `FromStr`.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(PlanType, "plan type", {
    Residential => "residential",
    Commercial => "commercial",
    Industrial => "industrial",
    TimeOfUse => "time_of_use",
});

text_enum!(
    /// Lifecycle of a crawl job, a per-company run, and the persisted crawl log row.
    CrawlStatus, "crawl status", {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Partial => "partial",
    Cancelled => "cancelled",
});

text_enum!(TriggerType, "trigger type", {
    Scheduled => "scheduled",
    Manual => "manual",
});

text_enum!(
    /// Classification of a single field-level change.
    ChangeKind, "change kind", {
    Initial => "initial",
    Increase => "increase",
    Decrease => "decrease",
    Changed => "changed",
});

text_enum!(AlertKind, "alert type", {
    CrawlFailure => "crawl_failure",
    PriceChange => "price_change",
    WeeklyReport => "weekly_report",
});

impl CrawlStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CrawlStatus::Success | CrawlStatus::Failed | CrawlStatus::Partial | CrawlStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub code: String,
    pub name_ja: String,
    pub name_en: Option<String>,
    pub name_ko: Option<String>,
    pub website_url: Option<String>,
    pub price_page_url: Option<String>,
    pub region: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Company attributes as written by seeding; upserted by `code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCompany {
    pub code: String,
    pub name_ja: String,
    #[serde(default)]
    pub name_en: Option<String>,
    #[serde(default)]
    pub name_ko: Option<String>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub price_page_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// One block of a tiered energy charge. `upper_kwh = None` is the open-ended top tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub upper_kwh: Option<f64>,
    pub unit_price: f64,
}

/// Tariff values shared by crawled records and stored plans.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tariff {
    pub base_charge: Option<f64>,
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub price_tiers: Vec<PriceTier>,
    pub fuel_adjustment: Option<f64>,
    pub renewable_surcharge: Option<f64>,
    /// Floor applied instead of a base charge on minimum-charge tariffs.
    #[serde(default)]
    pub minimum_charge: Option<f64>,
    /// Vendor-specific structured data. Numeric band prices live under `bands`.
    pub time_of_use: Option<Value>,
}

/// Normalized output of a vendor crawler for one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlanRecord {
    pub plan_code: String,
    pub plan_name_ja: String,
    pub plan_name_en: Option<String>,
    pub plan_type: PlanType,
    pub contract_type: Option<String>,
    #[serde(flatten)]
    pub tariff: Tariff,
    pub effective_date: Option<NaiveDate>,
    pub source_url: String,
    /// Captured page fragments kept for audit; never compared.
    pub raw_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePlan {
    pub id: i64,
    pub company_id: i64,
    pub plan_code: String,
    pub plan_name_ja: String,
    pub plan_name_en: Option<String>,
    pub plan_type: PlanType,
    pub contract_type: Option<String>,
    #[serde(flatten)]
    pub tariff: Tariff,
    pub effective_date: NaiveDate,
    pub source_url: Option<String>,
    pub raw_data: Value,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPricePlan {
    pub company_id: i64,
    pub plan_code: String,
    pub plan_name_ja: String,
    pub plan_name_en: Option<String>,
    pub plan_type: PlanType,
    pub contract_type: Option<String>,
    #[serde(flatten)]
    pub tariff: Tariff,
    pub effective_date: NaiveDate,
    pub source_url: Option<String>,
    pub raw_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub id: i64,
    pub price_plan_id: i64,
    pub company_id: i64,
    pub plan_code: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_kind: ChangeKind,
    pub change_details: Option<Value>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceHistory {
    pub price_plan_id: i64,
    pub company_id: i64,
    pub plan_code: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_kind: ChangeKind,
    pub change_details: Option<Value>,
}

/// Persisted record of a crawl. `company_id = None` marks the job-level row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlLog {
    pub id: i64,
    pub company_id: Option<i64>,
    pub company_name: Option<String>,
    pub status: CrawlStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub plans_found: i32,
    pub plans_created: i32,
    pub plans_updated: i32,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCrawlLog {
    pub company_id: Option<i64>,
    pub status: CrawlStatus,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
}

/// Mutation applied to a non-terminal crawl log row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrawlLogUpdate {
    pub status: Option<CrawlStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plans_found: Option<i32>,
    pub plans_created: Option<i32>,
    pub plans_updated: Option<i32>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

impl CrawlLogUpdate {
    pub fn status(status: CrawlStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlLogFilter {
    pub company_id: Option<i64>,
    pub status: Option<CrawlStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSetting {
    pub id: i64,
    pub alert_type: AlertKind,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecipient {
    pub id: i64,
    pub alert_setting_id: i64,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_through_strings() {
        for status in CrawlStatus::ALL {
            assert_eq!(status.as_str().parse::<CrawlStatus>(), Ok(*status));
        }
        assert_eq!("time_of_use".parse::<PlanType>(), Ok(PlanType::TimeOfUse));
        let err = "sometimes".parse::<TriggerType>().expect_err("unknown trigger");
        assert_eq!(err.kind, "trigger type");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CrawlStatus::Pending.is_terminal());
        assert!(!CrawlStatus::Running.is_terminal());
        assert!(CrawlStatus::Partial.is_terminal());
        assert!(CrawlStatus::Cancelled.is_terminal());
    }

    #[test]
    fn raw_record_flattens_tariff_fields() {
        let record = RawPlanRecord {
            plan_code: "tepco_jyuryo_b".into(),
            plan_name_ja: "従量電灯B".into(),
            plan_name_en: Some("Meter-Rate Lighting B".into()),
            plan_type: PlanType::Residential,
            contract_type: Some("30A".into()),
            tariff: Tariff {
                base_charge: Some(935.25),
                ..Default::default()
            },
            effective_date: NaiveDate::from_ymd_opt(2024, 4, 1),
            source_url: "https://example.test/plan".into(),
            raw_data: Value::Null,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["base_charge"], serde_json::json!(935.25));
        assert_eq!(json["plan_type"], "residential");
    }
}
