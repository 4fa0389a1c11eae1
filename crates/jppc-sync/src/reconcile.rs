//! Compares a freshly crawled plan with the stored current row of its lineage.

use std::collections::{BTreeMap, HashMap};

use chrono::{Days, NaiveDate};
use jppc_core::{ChangeKind, NewPriceHistory, NewPricePlan, PricePlan, PriceTier, RawPlanRecord};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

/// Currency amounts closer than this are the same price.
pub const CURRENCY_EPSILON: f64 = 0.01;

const ROUNDING_SLACK: f64 = 1e-9;

/// Field name used by the marker row written when a lineage starts.
pub const INITIAL_MARKER_FIELD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Create,
    Supersede,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub kind: ChangeKind,
    pub details: Option<Value>,
}

impl FieldChange {
    pub fn into_history(self, price_plan_id: i64, company_id: i64, plan_code: &str) -> NewPriceHistory {
        NewPriceHistory {
            price_plan_id,
            company_id,
            plan_code: plan_code.to_string(),
            field_name: self.field_name,
            old_value: self.old_value,
            new_value: self.new_value,
            change_kind: self.kind,
            change_details: self.details,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub action: ReconcileAction,
    /// Row to insert; `None` when unchanged.
    pub new_plan: Option<NewPricePlan>,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// `observed_on` is the crawl date in the schedule's timezone, used when the page
    /// carries no effective date or repeats the current one.
    pub fn reconcile(
        &self,
        company_id: i64,
        record: &RawPlanRecord,
        current: Option<&PricePlan>,
        observed_on: NaiveDate,
    ) -> ReconcileResult {
        let Some(current) = current else {
            let effective_date = record.effective_date.unwrap_or(observed_on);
            return ReconcileResult {
                action: ReconcileAction::Create,
                new_plan: Some(new_plan(company_id, record, effective_date)),
                changes: vec![FieldChange {
                    field_name: INITIAL_MARKER_FIELD.to_string(),
                    old_value: None,
                    new_value: Some("initial".to_string()),
                    kind: ChangeKind::Initial,
                    details: None,
                }],
            };
        };

        let changes = diff(current, record);
        if changes.is_empty() {
            return ReconcileResult {
                action: ReconcileAction::Unchanged,
                new_plan: None,
                changes,
            };
        }

        let effective_date = successor_date(current.effective_date, record.effective_date, observed_on);
        ReconcileResult {
            action: ReconcileAction::Supersede,
            new_plan: Some(new_plan(company_id, record, effective_date)),
            changes,
        }
    }
}

/// A superseding row must start after the row it replaces.
fn successor_date(current: NaiveDate, crawled: Option<NaiveDate>, observed_on: NaiveDate) -> NaiveDate {
    crawled
        .filter(|d| *d > current)
        .or(Some(observed_on).filter(|d| *d > current))
        .or_else(|| current.checked_add_days(Days::new(1)))
        .unwrap_or(observed_on)
}

fn new_plan(company_id: i64, record: &RawPlanRecord, effective_date: NaiveDate) -> NewPricePlan {
    NewPricePlan {
        company_id,
        plan_code: record.plan_code.clone(),
        plan_name_ja: record.plan_name_ja.clone(),
        plan_name_en: record.plan_name_en.clone(),
        plan_type: record.plan_type,
        contract_type: record.contract_type.clone(),
        tariff: record.tariff.clone(),
        effective_date,
        source_url: Some(record.source_url.clone()),
        raw_data: record.raw_data.clone(),
    }
}

pub fn format_amount(value: f64) -> String {
    format!("{value:.2}")
}

pub fn same_amount(a: f64, b: f64) -> bool {
    (a - b).abs() < CURRENCY_EPSILON - ROUNDING_SLACK
}

/// Increase or decrease by the sign of `new - old`.
pub fn classify_direction(old: f64, new: f64) -> ChangeKind {
    if new > old {
        ChangeKind::Increase
    } else {
        ChangeKind::Decrease
    }
}

fn diff(current: &PricePlan, record: &RawPlanRecord) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    text_change(&mut changes, "plan_name_ja", Some(&current.plan_name_ja), Some(&record.plan_name_ja));
    text_change(
        &mut changes,
        "plan_name_en",
        current.plan_name_en.as_ref(),
        record.plan_name_en.as_ref(),
    );
    text_change(
        &mut changes,
        "plan_type",
        Some(&current.plan_type.as_str()),
        Some(&record.plan_type.as_str()),
    );
    text_change(
        &mut changes,
        "contract_type",
        current.contract_type.as_ref(),
        record.contract_type.as_ref(),
    );

    let (old, new) = (&current.tariff, &record.tariff);
    amount_change(&mut changes, "base_charge", old.base_charge, new.base_charge);
    amount_change(&mut changes, "unit_price", old.unit_price, new.unit_price);
    tier_changes(&mut changes, &old.price_tiers, &new.price_tiers);
    amount_change(&mut changes, "fuel_adjustment", old.fuel_adjustment, new.fuel_adjustment);
    amount_change(
        &mut changes,
        "renewable_surcharge",
        old.renewable_surcharge,
        new.renewable_surcharge,
    );
    amount_change(&mut changes, "minimum_charge", old.minimum_charge, new.minimum_charge);
    time_of_use_changes(&mut changes, old.time_of_use.as_ref(), new.time_of_use.as_ref());

    // Only a later announced date counts; the stored date may already sit past the page's.
    if let Some(crawled) = record.effective_date {
        if crawled > current.effective_date {
            changes.push(FieldChange {
                field_name: "effective_date".to_string(),
                old_value: Some(current.effective_date.to_string()),
                new_value: Some(crawled.to_string()),
                kind: ChangeKind::Changed,
                details: None,
            });
        }
    }

    changes
}

fn text_change<T: AsRef<str> + ?Sized>(
    changes: &mut Vec<FieldChange>,
    field: &str,
    old: Option<&T>,
    new: Option<&T>,
) {
    let old: Option<&str> = old.map(|v| v.as_ref());
    let new: Option<&str> = new.map(|v| v.as_ref());
    if old != new {
        changes.push(FieldChange {
            field_name: field.to_string(),
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
            kind: ChangeKind::Changed,
            details: None,
        });
    }
}

fn amount_change(changes: &mut Vec<FieldChange>, field: &str, old: Option<f64>, new: Option<f64>) {
    let kind = match (old, new) {
        (None, None) => return,
        (Some(a), Some(b)) if same_amount(a, b) => return,
        (Some(a), Some(b)) => classify_direction(a, b),
        _ => ChangeKind::Changed,
    };
    let details = match (old, new) {
        (Some(a), Some(b)) => Some(json!({ "delta": format_amount(b - a) })),
        _ => None,
    };
    changes.push(FieldChange {
        field_name: field.to_string(),
        old_value: old.map(format_amount),
        new_value: new.map(format_amount),
        kind,
        details,
    });
}

fn same_boundaries(old: &[PriceTier], new: &[PriceTier]) -> bool {
    old.len() == new.len()
        && old.iter().zip(new).all(|(a, b)| match (a.upper_kwh, b.upper_kwh) {
            (None, None) => true,
            (Some(x), Some(y)) => same_amount(x, y),
            _ => false,
        })
}

fn tier_changes(changes: &mut Vec<FieldChange>, old: &[PriceTier], new: &[PriceTier]) {
    if same_boundaries(old, new) {
        for (index, (a, b)) in old.iter().zip(new).enumerate() {
            amount_change(
                changes,
                &format!("price_tiers[{index}].unit_price"),
                Some(a.unit_price),
                Some(b.unit_price),
            );
        }
        return;
    }
    changes.push(FieldChange {
        field_name: "price_tiers".to_string(),
        old_value: Some(json!(old).to_string()),
        new_value: Some(json!(new).to_string()),
        kind: ChangeKind::Changed,
        details: Some(json!({ "old_tiers": old.len(), "new_tiers": new.len() })),
    });
}

/// Splits the numeric `bands` prices out of a time-of-use payload. The rest is `None` when empty.
fn split_time_of_use(payload: Option<&Value>) -> (BTreeMap<String, f64>, Option<Value>) {
    let mut bands = BTreeMap::new();
    let Some(mut rest) = payload.cloned() else {
        return (bands, None);
    };
    if let Some(fields) = rest.as_object_mut() {
        let drained = match fields.get_mut("bands") {
            Some(Value::Object(prices)) => {
                prices.retain(|band, price| match price.as_f64() {
                    Some(amount) => {
                        bands.insert(band.clone(), amount);
                        false
                    }
                    None => true,
                });
                prices.is_empty()
            }
            _ => false,
        };
        if drained {
            fields.remove("bands");
        }
        if fields.is_empty() {
            return (bands, None);
        }
    }
    (bands, Some(rest))
}

fn time_of_use_changes(changes: &mut Vec<FieldChange>, old: Option<&Value>, new: Option<&Value>) {
    let (old_bands, old_rest) = split_time_of_use(old);
    let (new_bands, new_rest) = split_time_of_use(new);

    let mut names: Vec<&String> = old_bands.keys().chain(new_bands.keys()).collect();
    names.sort();
    names.dedup();
    for name in names {
        amount_change(
            changes,
            &format!("time_of_use.{name}"),
            old_bands.get(name).copied(),
            new_bands.get(name).copied(),
        );
    }

    if old_rest != new_rest {
        changes.push(FieldChange {
            field_name: "time_of_use".to_string(),
            old_value: old_rest.as_ref().map(Value::to_string),
            new_value: new_rest.as_ref().map(Value::to_string),
            kind: ChangeKind::Changed,
            details: None,
        });
    }
}

/// Keeps one record per plan code. A repeated code replaces the earlier record in place.
pub fn collapse_duplicates(company_code: &str, records: Vec<RawPlanRecord>) -> Vec<RawPlanRecord> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<RawPlanRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.plan_code) {
            Some(&index) => {
                warn!(
                    company = company_code,
                    plan_code = %record.plan_code,
                    "reconciliation conflict: duplicate plan code in one crawl, later record wins"
                );
                kept[index] = record;
            }
            None => {
                positions.insert(record.plan_code.clone(), kept.len());
                kept.push(record);
            }
        }
    }
    kept
}
