//! Alert notifications. Delivery is fire-and-forget; failures are logged and swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use jppc_core::{AlertKind, AlertRecipient};
use jppc_storage::Store;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        kind: AlertKind,
        payload: &Value,
        recipients: &[AlertRecipient],
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _: AlertKind, _: &Value, _: &[AlertRecipient]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes alerts to the log instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        kind: AlertKind,
        payload: &Value,
        recipients: &[AlertRecipient],
    ) -> anyhow::Result<()> {
        let to: Vec<&str> = recipients.iter().map(|r| r.email.as_str()).collect();
        info!(alert = %kind, ?to, %payload, "alert");
        Ok(())
    }
}

/// Sends `payload` in the background when `kind` is enabled and has active recipients.
pub fn dispatch(
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    kind: AlertKind,
    payload: Value,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = deliver(store.as_ref(), notifier.as_ref(), kind, &payload).await {
            warn!(alert = %kind, error = %err, "alert delivery failed");
        }
    })
}

async fn deliver(
    store: &dyn Store,
    notifier: &dyn Notifier,
    kind: AlertKind,
    payload: &Value,
) -> anyhow::Result<()> {
    let enabled = store
        .alert_setting(kind)
        .await?
        .map(|s| s.is_enabled)
        .unwrap_or(false);
    if !enabled {
        debug!(alert = %kind, "alert disabled");
        return Ok(());
    }
    let recipients: Vec<_> = store
        .alert_recipients(kind)
        .await?
        .into_iter()
        .filter(|r| r.is_active)
        .collect();
    if recipients.is_empty() {
        debug!(alert = %kind, "no active recipients");
        return Ok(());
    }
    notifier.notify(kind, payload, &recipients).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jppc_storage::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(AlertKind, Vec<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(
            &self,
            kind: AlertKind,
            _payload: &Value,
            recipients: &[AlertRecipient],
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .push((kind, recipients.iter().map(|r| r.email.clone()).collect()));
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn enabled_alert_reaches_recipients() {
        let store = MemoryStore::new();
        store.add_recipient(AlertKind::PriceChange, "ops@example.test");
        let notifier = Arc::new(Recording::default());

        dispatch(Arc::new(store), notifier.clone(), AlertKind::PriceChange, json!({}))
            .await
            .expect("task");
        assert_eq!(
            notifier.sent.lock().clone(),
            vec![(AlertKind::PriceChange, vec!["ops@example.test".to_string()])]
        );
    }

    #[tokio::test]
    async fn disabled_alert_is_skipped() {
        let store = MemoryStore::new();
        store.add_recipient(AlertKind::WeeklyReport, "ops@example.test");
        let notifier = Arc::new(Recording::default());

        dispatch(Arc::new(store), notifier.clone(), AlertKind::WeeklyReport, json!({}))
            .await
            .expect("task");
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn delivery_errors_do_not_escape() {
        let store = MemoryStore::new();
        store.add_recipient(AlertKind::CrawlFailure, "ops@example.test");
        let notifier = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });

        let joined = dispatch(Arc::new(store), notifier.clone(), AlertKind::CrawlFailure, json!({})).await;
        assert!(joined.is_ok());
        assert_eq!(notifier.sent.lock().len(), 1);
    }
}
