//! Redirect URLs carried by push notifications.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::settings::{self, SettingsStore};
use crate::signals::{Signal, SignalHub};

/// Delay before the redirect signal fires, so the UI can finish mounting.
pub const DEFAULT_SIGNAL_DELAY: Duration = Duration::from_millis(2_500);

/// Payload paths checked in priority order. The order is a protocol contract.
const URL_PATHS: [&[&str]; 4] = [
    &["url"],
    &["data", "url"],
    &["aps", "data", "url"],
    &["custom", "target_url"],
];

/// Extract the first string at one of the redirect paths.
pub fn extract_redirect_url(payload: &Value) -> Option<&str> {
    URL_PATHS.iter().find_map(|path| {
        path.iter()
            .try_fold(payload, |node, segment| node.get(segment))
            .and_then(Value::as_str)
    })
}

/// Persists push-delivered redirect URLs and schedules the load signal.
#[derive(Clone)]
pub struct DeepLinkNotificationRouter {
    store: Arc<dyn SettingsStore>,
    signals: SignalHub,
    delay: Duration,
}

impl DeepLinkNotificationRouter {
    pub fn new(store: Arc<dyn SettingsStore>, signals: SignalHub, delay: Duration) -> Self {
        Self {
            store,
            signals,
            delay,
        }
    }

    /// Handle an inbound notification payload.
    ///
    /// Returns the extracted URL. Payloads without one are ignored. The URL
    /// is persisted before this returns; the signal follows after the delay.
    pub fn handle_notification(&self, payload: &Value) -> Option<String> {
        let Some(url) = extract_redirect_url(payload) else {
            tracing::debug!("Notification carried no redirect URL");
            return None;
        };
        let url = url.to_string();

        settings::persist_temporary_url(self.store.as_ref(), &url, Utc::now());
        tracing::info!("Push notification redirect stored");

        let signals = self.signals.clone();
        let delay = self.delay;
        let signal_url = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            signals.emit(Signal::LoadTemporaryUrl(signal_url));
        });

        Some(url)
    }
}

impl std::fmt::Debug for DeepLinkNotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepLinkNotificationRouter")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
