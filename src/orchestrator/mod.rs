//! Bootstrap state machine.
//!
//! The orchestrator races a fixed deadline against the
//! verification → enrichment → resolution pipeline and against connectivity
//! changes. Every mutation happens under one mutex. The first activation sets
//! `locked`; after that nothing changes state, endpoint or persisted
//! resolution settings.
//!
//! Each pipeline carries a run number. Starting a new pipeline, losing
//! connectivity and the deadline all bump it, and any effect from a stale
//! run is discarded.

mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

pub use self::state::ApplicationState;

use crate::attribution::{AttributionRecord, DeepLinkRecord};
use crate::config::Timings;
use crate::connectivity::{ConnectivityWatcher, Reachability};
use crate::resolver::EndpointResolver;
use crate::settings::{self, PersistedSettings, SettingsStore};
use crate::signals::{Signal, SignalHub};
use crate::verification::VerificationGate;

/// Collaborators handed to [`StateOrchestrator::start`].
pub struct OrchestratorDeps {
    pub store: Arc<dyn SettingsStore>,
    pub verifier: Arc<dyn VerificationGate>,
    pub resolver: Arc<dyn EndpointResolver>,
    pub signals: SignalHub,
    pub device_id: String,
    pub timings: Timings,
}

struct Inner {
    attribution: AttributionRecord,
    deeplink: Option<DeepLinkRecord>,
    settings: PersistedSettings,
    active_endpoint: Option<String>,
    locked: bool,
    prompt_visible: bool,
    run: u64,
}

impl Inner {
    fn is_current(&self, run: u64) -> bool {
        !self.locked && self.run == run
    }
}

pub struct StateOrchestrator {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ApplicationState>,
    store: Arc<dyn SettingsStore>,
    verifier: Arc<dyn VerificationGate>,
    resolver: Arc<dyn EndpointResolver>,
    signals: SignalHub,
    device_id: String,
    enrichment_grace: Duration,
    deadline_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    connectivity_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StateOrchestrator {
    /// Load persisted settings, arm the deadline and start watching
    /// connectivity. Must be called from within a Tokio runtime.
    pub fn start(deps: OrchestratorDeps, connectivity: &ConnectivityWatcher) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ApplicationState::Initializing);
        tracing::info!(state = %ApplicationState::Initializing, "Bootstrap starting");

        let settings = PersistedSettings::load(deps.store.as_ref());
        let deadline = deps.timings.deadline;

        let orchestrator = Arc::new(Self {
            inner: Mutex::new(Inner {
                attribution: AttributionRecord::default(),
                deeplink: None,
                settings,
                active_endpoint: None,
                locked: false,
                prompt_visible: false,
                run: 0,
            }),
            state_tx,
            store: deps.store,
            verifier: deps.verifier,
            resolver: deps.resolver,
            signals: deps.signals,
            device_id: deps.device_id,
            enrichment_grace: deps.timings.enrichment_grace,
            deadline_task: std::sync::Mutex::new(None),
            connectivity_task: std::sync::Mutex::new(None),
        });

        let deadline_task = spawn_deadline(Arc::downgrade(&orchestrator), deadline);
        set_task(&orchestrator.deadline_task, deadline_task);

        orchestrator.set_state(ApplicationState::PreparingData);

        let connectivity_task =
            spawn_connectivity(Arc::downgrade(&orchestrator), connectivity.subscribe());
        set_task(&orchestrator.connectivity_task, connectivity_task);

        orchestrator
    }

    pub fn state(&self) -> ApplicationState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplicationState> {
        self.state_tx.subscribe()
    }

    /// Wait until the state satisfies `predicate` and return it.
    pub async fn wait_for(&self, predicate: impl FnMut(&ApplicationState) -> bool) -> ApplicationState {
        let mut rx = self.subscribe();
        match rx.wait_for(predicate).await {
            Ok(state) => state.clone(),
            // Unreachable while `self` holds the sender.
            Err(_) => self.state(),
        }
    }

    pub async fn active_endpoint(&self) -> Option<String> {
        self.inner.lock().await.active_endpoint.clone()
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.lock().await.locked
    }

    pub async fn prompt_visible(&self) -> bool {
        self.inner.lock().await.prompt_visible
    }

    pub async fn settings(&self) -> PersistedSettings {
        self.inner.lock().await.settings.clone()
    }

    /// Store merged attribution and, unless already activated, start a
    /// pipeline for it. A newer delivery supersedes a running pipeline.
    pub async fn process_attribution(self: &Arc<Self>, record: AttributionRecord) {
        let mut inner = self.inner.lock().await;
        inner.attribution = record.clone();
        settings::persist_attribution(self.store.as_ref(), &record);

        if inner.locked || inner.active_endpoint.is_some() {
            tracing::debug!("Attribution received after activation, ignoring");
            return;
        }
        // Disconnected only resolves to Standby; the record waits for a later
        // delivery.
        let disconnected = *self.state_tx.borrow() == ApplicationState::Disconnected;
        if disconnected {
            tracing::info!("Attribution received while disconnected, not starting a pipeline");
            return;
        }

        inner.run += 1;
        let run = inner.run;
        drop(inner);

        tracing::info!(run, fields = record.len(), "Starting verification pipeline");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_pipeline(run, record).await });
    }

    pub async fn process_deeplink(&self, record: DeepLinkRecord) {
        let mut inner = self.inner.lock().await;
        settings::persist_deeplink(self.store.as_ref(), &record);
        inner.deeplink = Some(record);
    }

    /// Activate `endpoint` unless already locked. Returns whether this call
    /// performed the activation.
    pub async fn activate_application(&self, endpoint: impl Into<String>) -> bool {
        let mut inner = self.inner.lock().await;
        self.activate_locked(&mut inner, endpoint.into())
    }

    /// Record the platform's answer to the permission request.
    pub async fn authorize_notifications(&self, granted: bool) {
        let mut inner = self.inner.lock().await;
        settings::record_notification_permission(self.store.as_ref(), granted);
        inner.settings.notifications_enabled = granted;
        inner.settings.notifications_declined = !granted;
        inner.prompt_visible = false;
        tracing::info!(granted, "Notification permission recorded");
    }

    /// Defer the prompt; it may show again after the cooldown.
    pub async fn decline_notifications(&self) {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        settings::record_notification_prompt_time(self.store.as_ref(), now);
        inner.settings.last_notification_prompt_time = Some(now);
        inner.prompt_visible = false;
        tracing::info!("Notification prompt deferred");
    }

    async fn run_pipeline(self: Arc<Self>, run: u64, attribution: AttributionRecord) {
        if !self.transition(run, ApplicationState::Verifying).await {
            return;
        }

        let verified = match self.verifier.verify().await {
            Ok(verified) => verified,
            Err(e) => {
                tracing::warn!(run, "Verification failed: {}", e);
                false
            }
        };
        if !verified {
            tracing::info!(run, "Verification negative, standing by");
            self.transition(run, ApplicationState::Standby).await;
            return;
        }

        if !self.transition(run, ApplicationState::Verified).await {
            return;
        }
        self.resolve(run, attribution).await;
    }

    async fn resolve(&self, run: u64, attribution: AttributionRecord) {
        let settings = {
            let inner = self.inner.lock().await;
            if !inner.is_current(run) {
                return;
            }
            inner.settings.clone()
        };

        if !attribution.has_data() {
            tracing::info!(run, "No attribution data, trying cached endpoint");
            self.fall_back_to_cached(run).await;
            return;
        }

        if settings.is_inactive() {
            tracing::info!(run, "Operating mode is inactive, standing by");
            self.transition(run, ApplicationState::Standby).await;
            return;
        }

        let attribution = if settings.is_first_launch() && attribution.is_organic_install() {
            match self.enrich(run).await {
                Some(enriched) => enriched,
                None => return,
            }
        } else {
            attribution
        };

        self.resolve_destination(run, attribution).await;
    }

    /// Cold-start enrichment: wait out the grace period, fetch attribution by
    /// device id and fold in any buffered deep-link fields.
    async fn enrich(&self, run: u64) -> Option<AttributionRecord> {
        tracing::info!(run, grace = ?self.enrichment_grace, "Organic first launch, enriching attribution");
        tokio::time::sleep(self.enrichment_grace).await;
        if !self.inner.lock().await.is_current(run) {
            return None;
        }

        let fetched = match self.resolver.fetch_attribution(&self.device_id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(run, "Attribution enrichment failed: {}", e);
                self.transition(run, ApplicationState::Standby).await;
                return None;
            }
        };

        let mut inner = self.inner.lock().await;
        if !inner.is_current(run) {
            return None;
        }
        let enriched = match inner.deeplink.as_ref() {
            Some(deeplink) => fetched.merged_with_deep_link(deeplink, ""),
            None => fetched,
        };
        settings::persist_attribution(self.store.as_ref(), &enriched);
        inner.attribution = enriched.clone();
        Some(enriched)
    }

    async fn resolve_destination(&self, run: u64, attribution: AttributionRecord) {
        if let Some(url) = settings::temporary_url(self.store.as_ref()) {
            tracing::info!(run, "Activating push-delivered redirect");
            let mut inner = self.inner.lock().await;
            if inner.is_current(run) {
                self.activate_locked(&mut inner, url);
            }
            return;
        }

        match self.resolver.resolve_endpoint(&attribution).await {
            Ok(endpoint) => {
                let mut inner = self.inner.lock().await;
                if !inner.is_current(run) {
                    tracing::debug!(run, "Discarding stale endpoint resolution");
                    return;
                }
                settings::persist_resolution(self.store.as_ref(), &endpoint);
                inner.settings.endpoint = Some(endpoint.clone());
                inner.settings.operating_mode = Some(settings::OperatingMode::Active);
                inner.settings.initial_launch_completed = true;
                self.activate_locked(&mut inner, endpoint);
            }
            Err(e) => {
                tracing::warn!(run, "Endpoint resolution failed: {}", e);
                self.fall_back_to_cached(run).await;
            }
        }
    }

    async fn fall_back_to_cached(&self, run: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(run) {
            return;
        }
        match inner.settings.endpoint.clone() {
            Some(endpoint) => {
                tracing::info!(run, "Activating cached endpoint");
                self.activate_locked(&mut inner, endpoint);
            }
            None => {
                tracing::info!(run, "No cached endpoint, standing by");
                self.set_state(ApplicationState::Standby);
            }
        }
    }

    fn activate_locked(&self, inner: &mut Inner, endpoint: String) -> bool {
        if inner.locked {
            return false;
        }
        if let Some(task) = take_task(&self.deadline_task) {
            task.abort();
        }
        inner.active_endpoint = Some(endpoint.clone());
        self.set_state(ApplicationState::Ready(endpoint));
        inner.locked = true;

        if inner.settings.can_show_prompt() {
            inner.prompt_visible = true;
            self.signals.emit(Signal::ShowNotificationPrompt);
        }
        true
    }

    async fn transition(&self, run: u64, next: ApplicationState) -> bool {
        let inner = self.inner.lock().await;
        if !inner.is_current(run) {
            tracing::debug!(run, current = inner.run, to = %next, "Discarding stale transition");
            return false;
        }
        let disconnected = *self.state_tx.borrow() == ApplicationState::Disconnected;
        if disconnected && next != ApplicationState::Standby {
            tracing::debug!(run, to = %next, "Disconnected, refusing transition");
            return false;
        }
        self.set_state(next);
        true
    }

    async fn expire_deadline(&self) {
        let mut inner = self.inner.lock().await;
        if inner.locked {
            return;
        }
        inner.run += 1;
        tracing::warn!("Bootstrap deadline expired, standing by");
        self.set_state(ApplicationState::Standby);
    }

    async fn on_connectivity(&self, reachability: Reachability) {
        let mut inner = self.inner.lock().await;
        if inner.locked {
            return;
        }
        match reachability {
            Reachability::Unsatisfied => {
                inner.run += 1;
                self.set_state(ApplicationState::Disconnected);
            }
            Reachability::Satisfied => {
                let disconnected = *self.state_tx.borrow() == ApplicationState::Disconnected;
                if disconnected {
                    self.set_state(ApplicationState::Standby);
                }
            }
        }
    }

    fn set_state(&self, next: ApplicationState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Application state changed");
        }
    }
}

impl Drop for StateOrchestrator {
    fn drop(&mut self) {
        for slot in [&self.deadline_task, &self.connectivity_task] {
            if let Some(task) = take_task(slot) {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for StateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateOrchestrator")
            .field("state", &*self.state_tx.borrow())
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

fn set_task(slot: &std::sync::Mutex<Option<JoinHandle<()>>>, task: JoinHandle<()>) {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(task);
}

fn take_task(slot: &std::sync::Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

fn spawn_deadline(orchestrator: Weak<StateOrchestrator>, deadline: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if let Some(orchestrator) = orchestrator.upgrade() {
            orchestrator.expire_deadline().await;
        }
    })
}

fn spawn_connectivity(
    orchestrator: Weak<StateOrchestrator>,
    mut rx: watch::Receiver<Option<Reachability>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *rx.borrow_and_update();
        if let Some(reachability) = initial {
            let Some(this) = orchestrator.upgrade() else {
                return;
            };
            this.on_connectivity(reachability).await;
        }

        while rx.changed().await.is_ok() {
            let Some(reachability) = *rx.borrow_and_update() else {
                continue;
            };
            let Some(this) = orchestrator.upgrade() else {
                return;
            };
            this.on_connectivity(reachability).await;
        }
    })
}
