//! Table-driven extraction of tariff values from a vendor's plan page.

use chrono::NaiveDate;
use jppc_core::{PlanType, PriceTier, Tariff};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::dates::parse_vendor_date;
use crate::text::{normalize_text, parse_price, text_or_none};

static KWH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*kWh").expect("valid regex"));
static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").expect("valid selector"));
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("valid selector"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").expect("valid selector"));
static DATED_TEXT: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("p, span, div, caption, li, h1, h2, h3, h4, dd, td").expect("valid selector")
});

const EFFECTIVE_MARKERS: &[&str] = &["実施", "適用", "改定", "から"];
const RENEWABLE_MARKERS: &[&str] = &["再エネ賦課金", "再生可能エネルギー発電促進賦課金"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// Base charge per contract size plus block-tiered energy charge.
    Tiered,
    /// Minimum charge covering the first block, then tiered energy charge.
    MinimumChargeTiered,
    /// Base charge plus energy charge that varies by time band.
    TimeOfUse,
}

/// One plan page on a vendor site.
#[derive(Debug, Clone, Copy)]
pub struct PlanPage {
    pub plan_code: &'static str,
    pub name_ja: &'static str,
    pub name_en: &'static str,
    pub plan_type: PlanType,
    pub contract_type: &'static str,
    pub path: &'static str,
    pub layout: PageLayout,
    /// Row label identifying the reference base charge (`30A`, `1kVA`).
    pub base_row_marker: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTariff {
    pub tariff: Tariff,
    pub effective_date: Option<NaiveDate>,
    pub captured_rows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageParseError {
    #[error("page has no tables")]
    NoTables,
    #[error("page has no recognizable {0}")]
    Missing(&'static str),
}

struct TableText {
    text: String,
    rows: Vec<Vec<String>>,
}

impl TableText {
    fn from_element(table: ElementRef<'_>) -> Self {
        let rows: Vec<Vec<String>> = table
            .select(&ROW)
            .map(|row| {
                row.select(&CELL)
                    .filter_map(|cell| text_or_none(normalize_text(&cell.text().collect::<String>())))
                    .collect::<Vec<_>>()
            })
            .filter(|cells| !cells.is_empty())
            .collect();
        let text = normalize_text(&table.text().collect::<String>());
        Self { text, rows }
    }

    fn mentions(&self, markers: &[&str]) -> bool {
        markers.iter().any(|m| self.text.contains(m))
    }
}

fn row_label(cells: &[String]) -> String {
    if cells.len() > 1 {
        cells[..cells.len() - 1].join(" ")
    } else {
        cells.join(" ")
    }
}

fn row_price(cells: &[String]) -> Option<f64> {
    cells.last().and_then(|cell| parse_price(cell))
}

fn find_row_price(tables: &[TableText], table_markers: &[&str], row_markers: &[&str]) -> Option<f64> {
    tables
        .iter()
        .filter(|t| t.mentions(table_markers))
        .flat_map(|t| t.rows.iter())
        .filter(|cells| cells.len() > 1)
        .find(|cells| {
            let label = row_label(cells);
            row_markers.iter().any(|m| label.contains(m))
        })
        .and_then(|cells| row_price(cells))
}

fn tier_from_row(cells: &[String]) -> Option<PriceTier> {
    if cells.len() < 2 {
        return None;
    }
    let label = row_label(cells);
    if label.contains("最低料金") {
        return None;
    }
    let bounds: Vec<f64> = KWH
        .captures_iter(&label)
        .filter_map(|cap| cap[1].parse().ok())
        .collect();
    if bounds.is_empty() {
        return None;
    }
    let upper_kwh = if label.contains("まで") || label.contains("以下") {
        bounds.last().copied()
    } else if label.contains("超") || label.contains("こえ") {
        None
    } else {
        return None;
    };
    Some(PriceTier {
        upper_kwh,
        unit_price: row_price(cells)?,
    })
}

fn time_band(label: &str) -> Option<&'static str> {
    if label.contains("昼間") || label.contains("デイ") {
        Some("daytime")
    } else if label.contains("夜間") || label.contains("ナイト") {
        Some("nighttime")
    } else if label.contains("朝晩") || label.contains("リビング") || label.contains("ホーム") {
        Some("living")
    } else {
        None
    }
}

fn effective_date(document: &Html) -> Option<NaiveDate> {
    document
        .select(&DATED_TEXT)
        .filter_map(|el| {
            let own_text: String = el
                .children()
                .filter_map(|child| child.value().as_text().map(|t| t.to_string()))
                .collect();
            text_or_none(normalize_text(&own_text))
        })
        .filter(|text| EFFECTIVE_MARKERS.iter().any(|m| text.contains(m)))
        .find_map(|text| parse_vendor_date(&text).ok())
}

/// Extracts tariff values from one plan page.
pub fn parse_tariff_page(html: &str, page: &PlanPage) -> Result<ParsedTariff, PageParseError> {
    let document = Html::parse_document(html);
    let tables: Vec<TableText> = document.select(&TABLE).map(TableText::from_element).collect();
    if tables.is_empty() {
        return Err(PageParseError::NoTables);
    }

    let mut payload = Map::new();
    let mut tariff = Tariff::default();

    if let Some(marker) = page.base_row_marker {
        tariff.base_charge = find_row_price(&tables, &["基本料金"], &[marker]);
        payload.insert("reference_contract".into(), json!(marker));
    }

    if page.layout == PageLayout::MinimumChargeTiered {
        let minimum = find_row_price(&tables, &["最低料金"], &["最低料金"])
            .ok_or(PageParseError::Missing("minimum charge"))?;
        tariff.minimum_charge = Some(minimum);
    }

    let energy_tables = tables
        .iter()
        .filter(|t| t.mentions(&["電力量料金", "従量料金"]));
    match page.layout {
        PageLayout::Tiered | PageLayout::MinimumChargeTiered => {
            tariff.price_tiers = energy_tables
                .flat_map(|t| t.rows.iter())
                .filter_map(|cells| tier_from_row(cells))
                .collect();
            if tariff.price_tiers.is_empty() {
                tariff.unit_price = find_row_price(&tables, &["電力量料金"], &["1kWh"]);
            }
        }
        PageLayout::TimeOfUse => {
            let mut bands = Map::new();
            for cells in energy_tables.flat_map(|t| t.rows.iter()) {
                if cells.len() < 2 {
                    continue;
                }
                if let (Some(band), Some(price)) = (time_band(&row_label(cells)), row_price(cells)) {
                    bands.entry(band).or_insert(json!(price));
                }
            }
            if bands.is_empty() {
                return Err(PageParseError::Missing("time-of-use rates"));
            }
            payload.insert("bands".into(), Value::Object(bands));
        }
    }

    tariff.fuel_adjustment = find_row_price(&tables, &["燃料費調整"], &["燃料費調整"]);
    tariff.renewable_surcharge = find_row_price(&tables, RENEWABLE_MARKERS, RENEWABLE_MARKERS);

    let has_energy_rates = !tariff.price_tiers.is_empty()
        || tariff.unit_price.is_some()
        || payload.contains_key("bands");
    if !has_energy_rates {
        return Err(PageParseError::Missing("energy charge"));
    }
    if tariff.base_charge.is_none() && page.layout != PageLayout::MinimumChargeTiered {
        return Err(PageParseError::Missing("base charge"));
    }

    tariff.time_of_use = Some(Value::Object(payload));
    let captured_rows = tables
        .iter()
        .flat_map(|t| t.rows.iter())
        .map(|cells| cells.join(" | "))
        .collect();

    Ok(ParsedTariff {
        tariff,
        effective_date: effective_date(&document),
        captured_rows,
    })
}
