//! `launchgate run` - drive one bootstrap from JSON files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::attribution::{AttributionRecord, DeepLinkRecord};
use crate::bootstrap::{Bootstrap, BootstrapParts};
use crate::config::Config;
use crate::orchestrator::ApplicationState;
use crate::signals::Signal;
use crate::verification::StaticGate;

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Attribution payload (JSON object) to deliver.
    #[arg(long)]
    pub attribution: Option<PathBuf>,

    /// Deep-link payload (JSON object) to deliver.
    #[arg(long)]
    pub deeplink: Option<PathBuf>,

    /// Push notification payload to route before attribution arrives.
    #[arg(long)]
    pub push: Option<PathBuf>,

    /// Push registration token to record.
    #[arg(long)]
    pub push_token: Option<String>,

    /// Report an attribution SDK failure instead of delivering a payload.
    #[arg(long, conflicts_with = "attribution")]
    pub attribution_failure: Option<String>,

    /// Skip the remote verification read and treat it as passed.
    #[arg(long)]
    pub assume_verified: bool,
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// Drain the signals emitted so far. When a push redirect is pending, keep
/// listening until its delayed signal arrives or fails to show up in time.
async fn collect_signals(signals: &mut broadcast::Receiver<Signal>, redirect_due: Option<Instant>) -> Vec<Signal> {
    let mut emitted = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        emitted.push(signal);
    }
    if let Some(due) = redirect_due
        && !emitted.iter().any(|s| matches!(s, Signal::LoadTemporaryUrl(_)))
    {
        let deadline = due + Duration::from_millis(500);
        while let Ok(Ok(signal)) = tokio::time::timeout_at(deadline, signals.recv()).await {
            let done = matches!(signal, Signal::LoadTemporaryUrl(_));
            emitted.push(signal);
            if done {
                break;
            }
        }
    }
    emitted
}

pub async fn run_bootstrap_command(config_path: Option<&Path>, args: RunArgs) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(config_path)?;
    let patience = config.timings.deadline
        + config.timings.merge_debounce
        + Duration::from_secs(1);
    let push_delay = config.timings.push_signal_delay;

    let mut parts = BootstrapParts::from_config(config);
    if args.assume_verified {
        parts.verifier = Arc::new(StaticGate(true));
    }
    let bootstrap = Bootstrap::start(parts);
    let mut signals = bootstrap.subscribe();

    if let Some(token) = &args.push_token {
        bootstrap.record_push_token(token);
    }
    let mut redirect_due = None;
    if let Some(path) = &args.push {
        let payload = read_json(path)?;
        match bootstrap.handle_notification(&payload) {
            Some(url) => {
                println!("push redirect: {url}");
                redirect_due = Some(Instant::now() + push_delay);
            }
            None => println!("push payload carried no redirect URL"),
        }
    }
    if let Some(path) = &args.deeplink {
        let record = DeepLinkRecord::from_value(read_json(path)?)
            .with_context(|| format!("{} is not a JSON object", path.display()))?;
        bootstrap.receive_deeplink(record);
    }
    if let Some(reason) = &args.attribution_failure {
        bootstrap.receive_attribution_failure(reason.clone());
    } else {
        let record = match &args.attribution {
            Some(path) => AttributionRecord::from_value(read_json(path)?)
                .with_context(|| format!("{} is not a JSON object", path.display()))?,
            None => AttributionRecord::default(),
        };
        bootstrap.receive_attribution(record);
    }

    let orchestrator = Arc::clone(bootstrap.orchestrator());
    let state = match tokio::time::timeout(
        patience,
        orchestrator.wait_for(ApplicationState::is_settled),
    )
    .await
    {
        Ok(state) => state,
        Err(_) => orchestrator.state(),
    };

    let emitted = collect_signals(&mut signals, redirect_due).await;
    for signal in emitted {
        println!("signal: {}", signal.name());
        if let Signal::LoadTemporaryUrl(url) = signal {
            println!("  url: {url}");
        }
    }

    println!("state: {state}");
    if orchestrator.prompt_visible().await {
        println!("notification prompt: shown");
    }
    Ok(())
}
