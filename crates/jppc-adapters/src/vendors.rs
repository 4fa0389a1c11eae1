//! The supported power companies and their plan pages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jppc_core::{PlanType, RawPlanRecord};
use jppc_storage::HttpFetcher;
use serde_json::json;
use tracing::{info, warn};

use crate::tariff_page::{parse_tariff_page, PageLayout, PlanPage};
use crate::{CrawlContext, CrawlError, CrawlStage, VendorCrawler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Vendor {
    Tepco,
    Chubu,
    Kepco,
    Chugoku,
}

const TEPCO_PAGES: &[PlanPage] = &[
    PlanPage {
        plan_code: "tepco_metered_b",
        name_ja: "従量電灯B",
        name_en: "Meter-Rate Lighting B",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/ep/private/plan/standard/chargelist01.html",
        layout: PageLayout::Tiered,
        base_row_marker: Some("30A"),
    },
    PlanPage {
        plan_code: "tepco_metered_c",
        name_ja: "従量電灯C",
        name_en: "Meter-Rate Lighting C",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/ep/private/plan/standard/chargelist02.html",
        layout: PageLayout::Tiered,
        base_row_marker: Some("1kVA"),
    },
    PlanPage {
        plan_code: "tepco_smart_life_s",
        name_ja: "スマートライフS",
        name_en: "Smart Life S",
        plan_type: PlanType::TimeOfUse,
        contract_type: "時間帯別",
        path: "/ep/private/plan/smartlife/chargelist.html",
        layout: PageLayout::TimeOfUse,
        base_row_marker: Some("30A"),
    },
];

const CHUBU_PAGES: &[PlanPage] = &[
    PlanPage {
        plan_code: "chubu_metered_b",
        name_ja: "従量電灯B",
        name_en: "Meter-Rate Lighting B",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/home/basic/charge/menu/meterb.html",
        layout: PageLayout::Tiered,
        base_row_marker: Some("30A"),
    },
    PlanPage {
        plan_code: "chubu_metered_c",
        name_ja: "従量電灯C",
        name_en: "Meter-Rate Lighting C",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/home/basic/charge/menu/meterc.html",
        layout: PageLayout::Tiered,
        base_row_marker: Some("1kVA"),
    },
    PlanPage {
        plan_code: "chubu_smart_life",
        name_ja: "スマートライフプラン",
        name_en: "Smart Life Plan",
        plan_type: PlanType::TimeOfUse,
        contract_type: "時間帯別",
        path: "/home/basic/charge/menu/smartlife.html",
        layout: PageLayout::TimeOfUse,
        base_row_marker: Some("10kVA"),
    },
];

const KEPCO_PAGES: &[PlanPage] = &[
    PlanPage {
        plan_code: "kepco_metered_a",
        name_ja: "従量電灯A",
        name_en: "Meter-Rate Lighting A",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/home/ryoukin/menu/dento_a.html",
        layout: PageLayout::MinimumChargeTiered,
        base_row_marker: None,
    },
    PlanPage {
        plan_code: "kepco_metered_b",
        name_ja: "従量電灯B",
        name_en: "Meter-Rate Lighting B",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/home/ryoukin/menu/dento_b.html",
        layout: PageLayout::Tiered,
        base_row_marker: Some("1kVA"),
    },
    PlanPage {
        plan_code: "kepco_hapie_time",
        name_ja: "はぴeタイム",
        name_en: "Hapie Time",
        plan_type: PlanType::TimeOfUse,
        contract_type: "時間帯別",
        path: "/home/ryoukin/menu/hapie.html",
        layout: PageLayout::TimeOfUse,
        base_row_marker: Some("1kVA"),
    },
];

const CHUGOKU_PAGES: &[PlanPage] = &[
    PlanPage {
        plan_code: "chugoku_metered_a",
        name_ja: "従量電灯A",
        name_en: "Meter-Rate Lighting A",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/elec/personal/menu/juryo-a/",
        layout: PageLayout::MinimumChargeTiered,
        base_row_marker: None,
    },
    PlanPage {
        plan_code: "chugoku_metered_b",
        name_ja: "従量電灯B",
        name_en: "Meter-Rate Lighting B",
        plan_type: PlanType::Residential,
        contract_type: "従量電灯",
        path: "/elec/personal/menu/juryo-b/",
        layout: PageLayout::Tiered,
        base_row_marker: Some("1kVA"),
    },
    PlanPage {
        plan_code: "chugoku_electric_delight_smart",
        name_ja: "ぐっとずっと。プラン スマートコース",
        name_en: "Gutto Zutto Plan Smart Course",
        plan_type: PlanType::Residential,
        contract_type: "定額",
        path: "/elec/personal/menu/electric-delight/",
        layout: PageLayout::MinimumChargeTiered,
        base_row_marker: None,
    },
];

impl Vendor {
    pub const ALL: [Vendor; 4] = [Vendor::Tepco, Vendor::Chubu, Vendor::Kepco, Vendor::Chugoku];

    pub fn code(self) -> &'static str {
        match self {
            Vendor::Tepco => "tepco",
            Vendor::Chubu => "chubu",
            Vendor::Kepco => "kepco",
            Vendor::Chugoku => "chugoku",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|v| v.code().eq_ignore_ascii_case(code))
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Vendor::Tepco => "https://www.tepco.co.jp",
            Vendor::Chubu => "https://www.chuden.co.jp",
            Vendor::Kepco => "https://www.kepco.co.jp",
            Vendor::Chugoku => "https://www.energia.co.jp",
        }
    }

    pub fn pages(self) -> &'static [PlanPage] {
        match self {
            Vendor::Tepco => TEPCO_PAGES,
            Vendor::Chubu => CHUBU_PAGES,
            Vendor::Kepco => KEPCO_PAGES,
            Vendor::Chugoku => CHUGOKU_PAGES,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Crawls a vendor's plan pages over HTTP.
#[derive(Debug, Clone)]
pub struct SiteCrawler {
    vendor: Vendor,
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl SiteCrawler {
    pub fn new(vendor: Vendor, http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(vendor, vendor.base_url(), http)
    }

    pub fn with_base_url(vendor: Vendor, base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            vendor,
            base_url,
            http,
        }
    }

    fn page_url(&self, page: &PlanPage) -> String {
        format!("{}{}", self.base_url, page.path)
    }
}

#[async_trait]
impl VendorCrawler for SiteCrawler {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn price_page_urls(&self) -> Vec<String> {
        self.vendor.pages().iter().map(|p| self.page_url(p)).collect()
    }

    async fn discover_plans(&self, ctx: &CrawlContext) -> Result<Vec<RawPlanRecord>, CrawlError> {
        let mut records = Vec::with_capacity(self.vendor.pages().len());
        for page in self.vendor.pages() {
            ctx.checkpoint(self.vendor)?;
            let url = self.page_url(page);
            let fetched = ctx.fetch_page(&self.http, self.vendor, &url).await?;
            let parsed = parse_tariff_page(&fetched.body, page).map_err(|err| {
                warn!(vendor = %self.vendor, plan_code = page.plan_code, %err, "tariff page did not parse");
                CrawlError::permanent(self.vendor, CrawlStage::Parse, format!("{url}: {err}"))
            })?;

            records.push(RawPlanRecord {
                plan_code: page.plan_code.to_string(),
                plan_name_ja: page.name_ja.to_string(),
                plan_name_en: Some(page.name_en.to_string()),
                plan_type: page.plan_type,
                contract_type: Some(page.contract_type.to_string()),
                tariff: parsed.tariff,
                effective_date: parsed.effective_date,
                source_url: fetched.final_url.clone(),
                raw_data: json!({
                    "source_url": fetched.final_url,
                    "fetched_at": Utc::now(),
                    "rows": parsed.captured_rows,
                }),
            });
        }
        info!(vendor = %self.vendor, plans = records.len(), "vendor pages parsed");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_resolve_case_insensitively() {
        assert_eq!(Vendor::from_code("TEPCO"), Some(Vendor::Tepco));
        assert_eq!(Vendor::from_code(" chugoku "), Some(Vendor::Chugoku));
        assert_eq!(Vendor::from_code("hepco"), None);
    }

    #[test]
    fn every_vendor_has_unique_prefixed_plan_codes() {
        for vendor in Vendor::ALL {
            let pages = vendor.pages();
            assert!(!pages.is_empty());
            for page in pages {
                assert!(page.plan_code.starts_with(vendor.code()));
            }
            let mut codes: Vec<_> = pages.iter().map(|p| p.plan_code).collect();
            codes.sort_unstable();
            codes.dedup();
            assert_eq!(codes.len(), pages.len());
        }
    }
}
