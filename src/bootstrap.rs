//! Bootstrap wiring for launchgate.
//!
//! Env files are loaded before configuration resolves:
//!
//!   explicit env vars > `./.env` > `~/.launchgate/.env`
//!
//! [`Bootstrap`] owns one instance of every runtime component and relays
//! merged attribution and deep links from the [`SignalHub`] into the
//! orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::attribution::{AttributionMerger, AttributionRecord, DeepLinkRecord};
use crate::config::{Config, ProbeConfig, Timings};
use crate::connectivity::ConnectivityWatcher;
use crate::orchestrator::{OrchestratorDeps, StateOrchestrator};
use crate::push::DeepLinkNotificationRouter;
use crate::resolver::{EndpointResolver, HttpEndpointResolver, RetrySchedule};
use crate::settings::{self, FileSettingsStore, SettingsStore};
use crate::signals::{Signal, SignalHub};
use crate::verification::{RemoteValueGate, StaticGate, VerificationGate};

/// Path to the launchgate-specific `.env` file: `~/.launchgate/.env`.
pub fn launchgate_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".launchgate")
        .join(".env")
}

/// Load `./.env`, then `~/.launchgate/.env`. dotenvy never overwrites
/// existing env vars, so earlier sources win.
pub fn load_launchgate_env() {
    let _ = dotenvy::dotenv();
    let path = launchgate_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        tracing::warn!("Failed to load {}: {}", path.display(), e);
    }
}

/// Collaborators for one bootstrap run.
pub struct BootstrapParts {
    pub store: Arc<dyn SettingsStore>,
    pub verifier: Arc<dyn VerificationGate>,
    pub resolver: Arc<dyn EndpointResolver>,
    pub device_id: String,
    pub timings: Timings,
    pub probe: Option<ProbeConfig>,
}

impl BootstrapParts {
    /// Build the HTTP-backed collaborators and open the settings file.
    pub fn from_config(config: Config) -> Self {
        let store: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::open(&config.store.path));
        let device_id = match config.device.device_id.clone() {
            Some(id) => id,
            None => settings::device_id_or_generate(store.as_ref()),
        };

        let verifier: Arc<dyn VerificationGate> = match &config.provider.verification_url {
            Some(url) => Arc::new(RemoteValueGate::new(
                url.clone(),
                config.provider.request_timeout,
            )),
            None => {
                tracing::warn!("No verification URL configured, verification will fail closed");
                Arc::new(StaticGate(false))
            }
        };

        let schedule = RetrySchedule::new(config.timings.retry_intervals.clone());
        let resolver: Arc<dyn EndpointResolver> = Arc::new(HttpEndpointResolver::new(
            config.provider,
            config.device.into_profile(device_id.clone()),
            Arc::clone(&store),
            schedule,
        ));

        Self {
            store,
            verifier,
            resolver,
            device_id,
            timings: config.timings,
            probe: config.probe,
        }
    }
}

/// One bootstrap instance: hub, merger, push router, connectivity and the
/// orchestrator they feed.
pub struct Bootstrap {
    signals: SignalHub,
    store: Arc<dyn SettingsStore>,
    merger: AttributionMerger,
    router: DeepLinkNotificationRouter,
    connectivity: ConnectivityWatcher,
    orchestrator: Arc<StateOrchestrator>,
    relay: JoinHandle<()>,
    probe: Option<JoinHandle<()>>,
}

impl Bootstrap {
    /// Wire and start every component. Must be called from within a Tokio
    /// runtime.
    pub fn start(parts: BootstrapParts) -> Self {
        let signals = SignalHub::default();
        let connectivity = ConnectivityWatcher::new();

        // Subscribe before anything can emit.
        let relay_rx = signals.subscribe();

        let merger = AttributionMerger::new(signals.clone(), parts.timings.merge_debounce);
        let router = DeepLinkNotificationRouter::new(
            Arc::clone(&parts.store),
            signals.clone(),
            parts.timings.push_signal_delay,
        );

        let orchestrator = StateOrchestrator::start(
            OrchestratorDeps {
                store: Arc::clone(&parts.store),
                verifier: parts.verifier,
                resolver: parts.resolver,
                signals: signals.clone(),
                device_id: parts.device_id,
                timings: parts.timings,
            },
            &connectivity,
        );

        let relay = spawn_relay(relay_rx, Arc::clone(&orchestrator));
        let probe = parts.probe.map(|probe| {
            tracing::info!(probe_target = %probe.target, "Starting connectivity probe");
            connectivity.spawn_probe(probe.target, probe.interval, probe.timeout)
        });

        Self {
            signals,
            store: parts.store,
            merger,
            router,
            connectivity,
            orchestrator,
            relay,
            probe,
        }
    }

    pub fn from_config(config: Config) -> Self {
        Self::start(BootstrapParts::from_config(config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    pub fn orchestrator(&self) -> &Arc<StateOrchestrator> {
        &self.orchestrator
    }

    pub fn connectivity(&self) -> &ConnectivityWatcher {
        &self.connectivity
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    pub fn receive_attribution(&self, record: AttributionRecord) {
        self.merger.receive_attribution(record);
    }

    pub fn receive_attribution_failure(&self, reason: impl Into<String>) {
        self.merger.receive_attribution_failure(reason);
    }

    pub fn receive_deeplink(&self, record: DeepLinkRecord) {
        self.merger.receive_deeplink(record);
    }

    pub fn handle_notification(&self, payload: &Value) -> Option<String> {
        self.router.handle_notification(payload)
    }

    /// Persist the push registration token read by later resolution requests.
    pub fn record_push_token(&self, token: &str) {
        let token = token.trim();
        if token.is_empty() {
            return;
        }
        settings::persist_push_token(self.store.as_ref(), token, Utc::now());
        tracing::debug!("Push token recorded");
    }
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        self.relay.abort();
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("orchestrator", &self.orchestrator)
            .field("merger", &self.merger)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

fn spawn_relay(
    mut rx: broadcast::Receiver<Signal>,
    orchestrator: Arc<StateOrchestrator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Signal::AttributionMerged(record)) => {
                    orchestrator.process_attribution(record).await;
                }
                Ok(Signal::DeepLinkReceived(record)) => {
                    orchestrator.process_deeplink(record).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Signal relay lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
