//! Monthly bill estimates for stored tariffs.

use std::cmp::Ordering;

use jppc_core::{PricePlan, PriceTier, Tariff};
use serde::Serialize;

/// Usage assumed when a comparison does not name one.
pub const DEFAULT_USAGE_KWH: f64 = 300.0;

/// Estimated bill in yen for `usage_kwh` in one month, rounded to sen.
///
/// Tiers are billed block by block up to each `upper_kwh`; the last tier takes the
/// remainder even when it names a bound. A minimum charge is a floor on the total.
/// Returns `None` when the tariff has no energy rate usable without a load profile
/// (time-of-use band prices only).
pub fn monthly_bill(tariff: &Tariff, usage_kwh: f64) -> Option<f64> {
    let usage_kwh = usage_kwh.max(0.0);
    let energy = if tariff.price_tiers.is_empty() {
        tariff.unit_price? * usage_kwh
    } else {
        tiered_energy(&tariff.price_tiers, usage_kwh)
    };
    let per_kwh_adjustments =
        tariff.fuel_adjustment.unwrap_or(0.0) + tariff.renewable_surcharge.unwrap_or(0.0);
    let mut total = tariff.base_charge.unwrap_or(0.0) + energy + usage_kwh * per_kwh_adjustments;
    if let Some(minimum) = tariff.minimum_charge {
        total = total.max(minimum);
    }
    Some(round_to_sen(total))
}

fn tiered_energy(tiers: &[PriceTier], usage_kwh: f64) -> f64 {
    let mut lower = 0.0;
    let mut total = 0.0;
    for (index, tier) in tiers.iter().enumerate() {
        if usage_kwh <= lower {
            break;
        }
        let is_last = index + 1 == tiers.len();
        let upper = match tier.upper_kwh {
            Some(bound) if !is_last => bound.min(usage_kwh),
            _ => usage_kwh,
        };
        if upper > lower {
            total += (upper - lower) * tier.unit_price;
        }
        match tier.upper_kwh {
            Some(bound) => lower = bound.max(lower),
            None => break,
        }
    }
    total
}

fn round_to_sen(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEstimate {
    #[serde(flatten)]
    pub plan: PricePlan,
    pub usage_kwh: f64,
    pub estimated_monthly_cost: Option<f64>,
}

/// Estimates every plan and orders them cheapest first. Plans without an estimate sort last.
pub fn compare_plans(plans: Vec<PricePlan>, usage_kwh: f64) -> Vec<PlanEstimate> {
    let mut estimates: Vec<PlanEstimate> = plans
        .into_iter()
        .map(|plan| PlanEstimate {
            estimated_monthly_cost: monthly_bill(&plan.tariff, usage_kwh),
            usage_kwh,
            plan,
        })
        .collect();
    estimates.sort_by(|a, b| match (a.estimated_monthly_cost, b.estimated_monthly_cost) {
        (Some(x), Some(y)) => x.total_cmp(&y).then(a.plan.id.cmp(&b.plan.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.plan.id.cmp(&b.plan.id),
    });
    estimates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use jppc_core::PlanType;
    use serde_json::json;

    fn tiered() -> Tariff {
        Tariff {
            base_charge: Some(935.25),
            price_tiers: vec![
                PriceTier {
                    upper_kwh: Some(120.0),
                    unit_price: 29.80,
                },
                PriceTier {
                    upper_kwh: Some(300.0),
                    unit_price: 36.40,
                },
                PriceTier {
                    upper_kwh: None,
                    unit_price: 40.49,
                },
            ],
            ..Default::default()
        }
    }

    fn stored(id: i64, tariff: Tariff) -> PricePlan {
        let now = Utc::now();
        PricePlan {
            id,
            company_id: id,
            plan_code: format!("plan{id}"),
            plan_name_ja: "プラン".into(),
            plan_name_en: None,
            plan_type: PlanType::Residential,
            contract_type: None,
            tariff,
            effective_date: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
            source_url: None,
            raw_data: json!({}),
            is_current: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn zero_usage_pays_the_base_charge() {
        assert_eq!(monthly_bill(&tiered(), 0.0), Some(935.25));
    }

    #[test]
    fn usage_on_a_tier_bound_stays_in_that_tier() {
        // 120 * 29.80
        assert_eq!(monthly_bill(&tiered(), 120.0), Some(4511.25));
        // + 180 * 36.40
        assert_eq!(monthly_bill(&tiered(), 300.0), Some(11063.25));
    }

    #[test]
    fn open_top_tier_takes_the_remainder_with_adjustments() {
        let mut tariff = tiered();
        tariff.fuel_adjustment = Some(-1.69);
        tariff.renewable_surcharge = Some(3.49);
        // 3576 + 6552 + 100 * 40.49 + 400 * 1.80
        assert_eq!(monthly_bill(&tariff, 400.0), Some(15832.25));
    }

    #[test]
    fn bounded_last_tier_still_bills_everything() {
        let mut tariff = tiered();
        tariff.price_tiers.pop();
        assert_eq!(monthly_bill(&tariff, 400.0), Some(14703.25));
    }

    #[test]
    fn flat_rate_and_minimum_charge_floor() {
        let flat = Tariff {
            unit_price: Some(30.0),
            ..Default::default()
        };
        assert_eq!(monthly_bill(&flat, 300.0), Some(9000.0));

        let minimum = Tariff {
            minimum_charge: Some(522.58),
            price_tiers: vec![
                PriceTier {
                    upper_kwh: Some(120.0),
                    unit_price: 20.21,
                },
                PriceTier {
                    upper_kwh: None,
                    unit_price: 25.61,
                },
            ],
            ..Default::default()
        };
        assert_eq!(monthly_bill(&minimum, 10.0), Some(522.58));
        assert_eq!(monthly_bill(&minimum, 100.0), Some(2021.0));
    }

    #[test]
    fn band_only_tariffs_have_no_estimate() {
        let bands = Tariff {
            base_charge: Some(1180.0),
            time_of_use: Some(json!({ "bands": { "daytime": 35.76 } })),
            ..Default::default()
        };
        assert_eq!(monthly_bill(&bands, 300.0), None);
    }

    #[test]
    fn comparison_is_cheapest_first_with_unknowns_last() {
        let bands = Tariff {
            base_charge: Some(10.0),
            ..Default::default()
        };
        let cheap = Tariff {
            unit_price: Some(20.0),
            ..Default::default()
        };
        let ranked = compare_plans(
            vec![stored(1, bands), stored(2, tiered()), stored(3, cheap)],
            300.0,
        );
        let order: Vec<_> = ranked
            .iter()
            .map(|e| (e.plan.id, e.estimated_monthly_cost))
            .collect();
        assert_eq!(order, vec![(3, Some(6000.0)), (2, Some(11063.25)), (1, None)]);
    }
}
