use std::collections::BTreeMap;
use std::sync::Arc;

use jppc_storage::HttpFetcher;
use thiserror::Error;

use crate::vendors::{SiteCrawler, Vendor};
use crate::VendorCrawler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no crawler registered for company code `{0}`")]
    UnknownVendor(String),
}

/// Company code to crawler lookup, fixed once the process has started.
#[derive(Clone, Default)]
pub struct CrawlerRegistry {
    crawlers: BTreeMap<Vendor, Arc<dyn VendorCrawler>>,
}

impl CrawlerRegistry {
    /// A site crawler for every supported vendor, sharing one HTTP client.
    pub fn builtin(http: Arc<HttpFetcher>) -> Self {
        Vendor::ALL
            .into_iter()
            .fold(Self::default(), |registry, vendor| {
                registry.with(Arc::new(SiteCrawler::new(vendor, http.clone())))
            })
    }

    pub fn with(mut self, crawler: Arc<dyn VendorCrawler>) -> Self {
        self.crawlers.insert(crawler.vendor(), crawler);
        self
    }

    pub fn get(&self, company_code: &str) -> Result<Arc<dyn VendorCrawler>, RegistryError> {
        Vendor::from_code(company_code)
            .and_then(|vendor| self.crawlers.get(&vendor).cloned())
            .ok_or_else(|| RegistryError::UnknownVendor(company_code.to_string()))
    }

    pub fn vendors(&self) -> Vec<Vendor> {
        self.crawlers.keys().copied().collect()
    }
}
