//! Per-vendor request pacing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub default_interval: Duration,
    pub overrides: HashMap<String, Duration>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(2))
    }
}

impl RateLimiterConfig {
    pub fn uniform(interval: Duration) -> Self {
        Self {
            default_interval: interval,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, vendor: impl Into<String>, interval: Duration) -> Self {
        self.overrides.insert(vendor.into(), interval);
        self
    }

    pub fn interval_for(&self, vendor: &str) -> Duration {
        self.overrides
            .get(vendor)
            .copied()
            .unwrap_or(self.default_interval)
    }
}

/// Enforces a minimum interval between consecutive grants for the same vendor.
///
/// Each vendor has its own lane guarded by a fair mutex, so waiters for one vendor are
/// served in arrival order and never hold up another vendor. Dropping an `acquire`
/// future before it completes leaves the lane untouched.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    lanes: Mutex<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    async fn lane(&self, vendor: &str) -> Arc<Mutex<Option<Instant>>> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(vendor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub async fn acquire(&self, vendor: &str) {
        let lane = self.lane(vendor).await;
        let mut last_grant = lane.lock().await;
        if let Some(previous) = *last_grant {
            let ready_at = previous + self.config.interval_for(vendor);
            if ready_at > Instant::now() {
                trace!(vendor, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_grant = Some(Instant::now());
    }
}
