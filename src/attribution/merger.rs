//! Debounced merge of attribution and deep-link deliveries.
//!
//! The SDK delivers conversion data and deep-link clicks independently and in
//! no fixed order. Attribution waits out a debounce window so a late deep link
//! can still join it; a deep link arriving while attribution is buffered
//! merges at once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{AttributionRecord, DEEP_LINK_KEY_PREFIX, DeepLinkRecord};
use crate::signals::{Signal, SignalHub};

/// Default quiet period after the last attribution delivery.
pub const DEFAULT_MERGE_DEBOUNCE: Duration = Duration::from_millis(2_500);

#[derive(Debug, Default)]
struct MergeBuffer {
    attribution: Option<AttributionRecord>,
    deeplink: Option<DeepLinkRecord>,
    pending_timer: Option<JoinHandle<()>>,
    /// Bumped on every delivery; one accumulation cycle per value.
    cycle: u64,
    merged_cycle: Option<u64>,
}

impl MergeBuffer {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            timer.abort();
        }
    }
}

/// Buffers SDK deliveries and emits [`Signal::AttributionMerged`] at most
/// once per accumulation cycle.
///
/// Must be used from within a Tokio runtime; the debounce timer is a task.
#[derive(Debug, Clone)]
pub struct AttributionMerger {
    buffer: Arc<Mutex<MergeBuffer>>,
    signals: SignalHub,
    debounce: Duration,
}

impl AttributionMerger {
    pub fn new(signals: SignalHub, debounce: Duration) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(MergeBuffer::default())),
            signals,
            debounce,
        }
    }

    pub fn receive_attribution(&self, record: AttributionRecord) {
        let mut buffer = lock(&self.buffer);
        buffer.attribution = Some(record);
        buffer.cycle += 1;
        buffer.cancel_timer();

        if buffer.deeplink.is_some() {
            merge(&mut buffer, &self.signals);
            return;
        }

        let cycle = buffer.cycle;
        let shared = Arc::clone(&self.buffer);
        let signals = self.signals.clone();
        let debounce = self.debounce;
        buffer.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut buffer = lock(&shared);
            if buffer.cycle != cycle {
                return;
            }
            // Detach our own handle rather than aborting the running task.
            buffer.pending_timer = None;
            merge(&mut buffer, &signals);
        }));
        tracing::debug!(cycle, ?debounce, "Attribution buffered, merge scheduled");
    }

    /// Deliver an SDK failure in place of conversion data.
    pub fn receive_attribution_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Attribution SDK reported failure: {}", reason);
        self.receive_attribution(AttributionRecord::failure(reason));
    }

    pub fn receive_deeplink(&self, record: DeepLinkRecord) {
        let mut buffer = lock(&self.buffer);
        buffer.deeplink = Some(record.clone());
        buffer.cycle += 1;
        self.signals.emit(Signal::DeepLinkReceived(record));
        buffer.cancel_timer();

        if buffer.attribution.is_some() {
            merge(&mut buffer, &self.signals);
        }
    }

    /// Whether a debounce timer is currently armed.
    pub fn has_pending_merge(&self) -> bool {
        lock(&self.buffer).pending_timer.is_some()
    }
}

fn lock(buffer: &Mutex<MergeBuffer>) -> MutexGuard<'_, MergeBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn merge(buffer: &mut MergeBuffer, signals: &SignalHub) {
    if buffer.merged_cycle == Some(buffer.cycle) {
        return;
    }
    let Some(attribution) = buffer.attribution.as_ref() else {
        return;
    };

    let merged = match buffer.deeplink.as_ref() {
        Some(deeplink) => attribution.merged_with_deep_link(deeplink, DEEP_LINK_KEY_PREFIX),
        None => attribution.clone(),
    };
    buffer.merged_cycle = Some(buffer.cycle);
    tracing::info!(
        cycle = buffer.cycle,
        fields = merged.len(),
        "Attribution merged"
    );
    signals.emit(Signal::AttributionMerged(merged));
}
