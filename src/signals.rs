//! Typed signals delivered to the UI layer.
//!
//! One [`SignalHub`] is created per bootstrap instance. Components that emit
//! signals hold a clone of the hub; consumers call [`SignalHub::subscribe`].

use tokio::sync::broadcast;

use crate::attribution::{AttributionRecord, DeepLinkRecord};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Attribution merged with any buffered deep link.
    AttributionMerged(AttributionRecord),
    /// A deep link arrived from the attribution SDK.
    DeepLinkReceived(DeepLinkRecord),
    /// A push notification carried a redirect URL.
    LoadTemporaryUrl(String),
    /// The application activated and the notification prompt may be shown.
    ShowNotificationPrompt,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttributionMerged(_) => "attribution-merged",
            Self::DeepLinkReceived(_) => "deep-link-received",
            Self::LoadTemporaryUrl(_) => "load-temporary-url",
            Self::ShowNotificationPrompt => "show-notification-prompt",
        }
    }
}

/// Instance-scoped fan-out of [`Signal`]s.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<Signal>,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    /// Emit a signal. Having no subscriber is not an error.
    pub fn emit(&self, signal: Signal) {
        let name = signal.name();
        match self.tx.send(signal) {
            Ok(receivers) => tracing::debug!(signal = name, receivers, "Signal emitted"),
            Err(_) => tracing::debug!(signal = name, "Signal dropped, no subscribers"),
        }
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
