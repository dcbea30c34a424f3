//! `launchgate status` and `launchgate reset`.

use std::path::Path;

use crate::config::StoreConfig;
use crate::settings::{self, FileSettingsStore, PersistedSettings, SettingsStore};

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn report(name: &str, result: CheckResult) {
    match result {
        CheckResult::Pass(detail) => println!("  [pass] {name}: {detail}"),
        CheckResult::Fail(detail) => println!("  [FAIL] {name}: {detail}"),
        CheckResult::Skip(reason) => println!("  [skip] {name}: {reason}"),
    }
}

pub fn run_status_command(config_path: Option<&Path>) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env_with_toml(config_path)?;
    let store = FileSettingsStore::open(&store_config.path);

    println!("launchgate status");
    println!("=================\n");
    println!("settings file: {}\n", store.path().display());

    let persisted = PersistedSettings::load(&store);
    for (name, result) in status_checks(&store, &persisted) {
        report(name, result);
    }
    Ok(())
}

fn status_checks(store: &dyn SettingsStore, persisted: &PersistedSettings) -> Vec<(&'static str, CheckResult)> {
    let endpoint = match &persisted.endpoint {
        Some(endpoint) => CheckResult::Pass(endpoint.clone()),
        None if store.get(settings::keys::PRIMARY_ENDPOINT).is_some() => {
            CheckResult::Fail("stored endpoint failed its checksum".to_string())
        }
        None => CheckResult::Skip("none cached".to_string()),
    };

    let mode = match persisted.operating_mode {
        Some(mode) if persisted.is_inactive() => CheckResult::Fail(format!("{mode} (kill-switch engaged)")),
        Some(mode) => CheckResult::Pass(mode.to_string()),
        None => CheckResult::Skip("not set".to_string()),
    };

    let first_launch = if persisted.initial_launch_completed {
        CheckResult::Pass("completed".to_string())
    } else {
        CheckResult::Skip("pending".to_string())
    };

    let notifications = if persisted.notifications_enabled {
        CheckResult::Pass("allowed".to_string())
    } else if persisted.notifications_declined {
        CheckResult::Fail("blocked".to_string())
    } else {
        let prompt = if persisted.can_show_prompt() { "may prompt" } else { "cooling down" };
        CheckResult::Skip(format!("undecided, {prompt}"))
    };

    let attribution = match settings::load_attribution_backup(store) {
        Some(record) => CheckResult::Pass(format!(
            "{} fields, organic={}",
            record.len(),
            record.is_organic_install()
        )),
        None => CheckResult::Skip("none".to_string()),
    };

    let deeplink = match settings::load_deeplink_backup(store) {
        Some(record) => CheckResult::Pass(format!("{} fields", record.fields().len())),
        None if store.get(settings::keys::DEEPLINK_BACKUP).is_some() => {
            CheckResult::Fail("backup could not be decoded".to_string())
        }
        None => CheckResult::Skip("none".to_string()),
    };

    let redirect = match settings::temporary_url(store) {
        Some(url) => CheckResult::Pass(url),
        None => CheckResult::Skip("none".to_string()),
    };

    let push_token = match settings::push_token(store) {
        Some(_) => CheckResult::Pass("recorded".to_string()),
        None => CheckResult::Skip("none".to_string()),
    };

    vec![
        ("Cached endpoint", endpoint),
        ("Operating mode", mode),
        ("First launch", first_launch),
        ("Notifications", notifications),
        ("Attribution backup", attribution),
        ("Deep-link backup", deeplink),
        ("Push redirect", redirect),
        ("Push token", push_token),
    ]
}

pub fn run_reset_command(config_path: Option<&Path>, yes: bool) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env_with_toml(config_path)?;
    if !yes {
        anyhow::bail!(
            "refusing to clear {} without --yes",
            store_config.path.display()
        );
    }
    let store = FileSettingsStore::open(&store_config.path);
    store.clear()?;
    println!("cleared {}", store.path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;
    use serde_json::json;

    fn label(result: &CheckResult) -> &'static str {
        match result {
            CheckResult::Pass(_) => "pass",
            CheckResult::Fail(_) => "fail",
            CheckResult::Skip(_) => "skip",
        }
    }

    #[test]
    fn test_empty_store_skips_everything() {
        let store = MemorySettingsStore::new();
        let persisted = PersistedSettings::load(&store);
        let checks = status_checks(&store, &persisted);
        assert!(checks.iter().all(|(_, result)| label(result) == "skip"));
    }

    #[test]
    fn test_kill_switch_and_tampering_fail() {
        let store = MemorySettingsStore::new();
        settings::persist_endpoint(&store, "https://dest");
        store.set(settings::keys::PRIMARY_ENDPOINT, json!("https://other"));
        settings::persist_mode(&store, settings::OperatingMode::Inactive);

        let persisted = PersistedSettings::load(&store);
        let checks = status_checks(&store, &persisted);
        assert_eq!(label(&checks[0].1), "fail");
        assert_eq!(label(&checks[1].1), "fail");
    }
}
