//! Persisted bootstrap settings.
//!
//! Settings live in a flat key/value store (`~/.launchgate/settings.json` for
//! the file-backed store). There is no multi-key atomicity: a process killed
//! between two writes leaves the earlier one applied, and every reader
//! tolerates missing or partial fields.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::attribution::{AttributionRecord, DeepLinkRecord};
use crate::error::StoreError;

/// Days that must pass after a deferred prompt before it may show again.
pub const PROMPT_COOLDOWN_DAYS: i64 = 3;

/// Persisted key names.
pub mod keys {
    pub const PRIMARY_ENDPOINT: &str = "primary-endpoint";
    pub const PRIMARY_ENDPOINT_CHECKSUM: &str = "primary-endpoint-checksum";
    pub const OPERATION_MODE: &str = "operation-mode";
    pub const FIRST_BOOT_FLAG: &str = "first-boot-flag";
    pub const NOTIF_ALLOWED: &str = "notif-allowed";
    pub const NOTIF_BLOCKED: &str = "notif-blocked";
    pub const NOTIF_PROMPT_TIMESTAMP: &str = "notif-prompt-timestamp";
    pub const ATTRIBUTION_BACKUP: &str = "attribution-backup";
    pub const DEEPLINK_BACKUP: &str = "deeplink-backup";
    pub const TEMP_REDIRECT_URL: &str = "temp-redirect-url";
    pub const TEMP_REDIRECT_URL_TIME: &str = "temp-redirect-url-time";
    pub const PUSH_TOKEN: &str = "push-token";
    pub const PUSH_TOKEN_TIME: &str = "push-token-time";
    pub const DEVICE_ID: &str = "device-id";
}

/// Key/value persistence used by the bootstrap runtime.
///
/// Implementations never fail loudly: a read error is reported as an absent
/// key and a write error is logged.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn remove(&self, key: &str);

    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }
}

fn lock_map(map: &Mutex<BTreeMap<String, Value>>) -> MutexGuard<'_, BTreeMap<String, Value>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        lock_map(&self.values).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock_map(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        lock_map(&self.values).insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        lock_map(&self.values).remove(key);
    }
}

/// JSON map on disk, written through on every mutation.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileSettingsStore {
    /// Default settings file path (~/.launchgate/settings.json).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".launchgate")
            .join("settings.json")
    }

    /// Open the store at `path`. A missing file starts empty; an unreadable
    /// or corrupt one is logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<BTreeMap<String, Value>>(&data) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring corrupt settings file {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read settings file {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop every key and remove the file.
    pub fn clear(&self) -> Result<(), StoreError> {
        lock_map(&self.values).clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.display().to_string(),
                source,
            }),
        }
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, data).map_err(io_err)
    }

    fn write_through(&self, values: &BTreeMap<String, Value>) {
        if let Err(e) = self.flush(values) {
            tracing::warn!("Failed to persist settings: {}", e);
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock_map(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = lock_map(&self.values);
        values.insert(key.to_string(), value);
        self.write_through(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = lock_map(&self.values);
        if values.remove(key).is_some() {
            self.write_through(&values);
        }
    }
}

/// Remote kill-switch as persisted under `operation-mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Active,
    Inactive,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Active" => Some(Self::Active),
            "Inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the persisted settings the orchestrator decides on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistedSettings {
    pub endpoint: Option<String>,
    pub operating_mode: Option<OperatingMode>,
    pub initial_launch_completed: bool,
    pub notifications_enabled: bool,
    pub notifications_declined: bool,
    pub last_notification_prompt_time: Option<DateTime<Utc>>,
}

impl PersistedSettings {
    pub fn load(store: &dyn SettingsStore) -> Self {
        Self {
            endpoint: load_endpoint(store),
            operating_mode: store
                .get_str(keys::OPERATION_MODE)
                .and_then(|mode| OperatingMode::parse(&mode)),
            initial_launch_completed: store.get_bool(keys::FIRST_BOOT_FLAG),
            notifications_enabled: store.get_bool(keys::NOTIF_ALLOWED),
            notifications_declined: store.get_bool(keys::NOTIF_BLOCKED),
            last_notification_prompt_time: store
                .get_i64(keys::NOTIF_PROMPT_TIMESTAMP)
                .and_then(from_epoch_millis),
        }
    }

    pub fn is_first_launch(&self) -> bool {
        !self.initial_launch_completed
    }

    pub fn is_inactive(&self) -> bool {
        self.operating_mode == Some(OperatingMode::Inactive)
    }

    pub fn can_show_prompt(&self) -> bool {
        self.can_show_prompt_at(Utc::now())
    }

    pub fn can_show_prompt_at(&self, now: DateTime<Utc>) -> bool {
        if self.notifications_enabled || self.notifications_declined {
            return false;
        }
        match self.last_notification_prompt_time {
            None => true,
            Some(last) => now - last >= chrono::Duration::days(PROMPT_COOLDOWN_DAYS),
        }
    }
}

pub fn epoch_millis(at: DateTime<Utc>) -> Value {
    Value::from(at.timestamp_millis())
}

fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn endpoint_checksum(endpoint: &str) -> String {
    let digest = Sha256::digest(endpoint.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn load_endpoint(store: &dyn SettingsStore) -> Option<String> {
    let endpoint = store.get_str(keys::PRIMARY_ENDPOINT)?;
    match store.get_str(keys::PRIMARY_ENDPOINT_CHECKSUM) {
        Some(checksum) if checksum != endpoint_checksum(&endpoint) => {
            tracing::warn!("Cached endpoint failed its checksum, ignoring it");
            None
        }
        _ => Some(endpoint),
    }
}

pub fn persist_endpoint(store: &dyn SettingsStore, endpoint: &str) {
    store.set(keys::PRIMARY_ENDPOINT, Value::from(endpoint));
    store.set(
        keys::PRIMARY_ENDPOINT_CHECKSUM,
        Value::from(endpoint_checksum(endpoint)),
    );
}

pub fn persist_mode(store: &dyn SettingsStore, mode: OperatingMode) {
    store.set(keys::OPERATION_MODE, Value::from(mode.as_str()));
}

pub fn mark_initial_launch_complete(store: &dyn SettingsStore) {
    store.set(keys::FIRST_BOOT_FLAG, Value::Bool(true));
}

/// Persist a freshly resolved endpoint: endpoint, `Active` mode and the
/// completed first launch, in that order.
pub fn persist_resolution(store: &dyn SettingsStore, endpoint: &str) {
    persist_endpoint(store, endpoint);
    persist_mode(store, OperatingMode::Active);
    mark_initial_launch_complete(store);
}

pub fn record_notification_permission(store: &dyn SettingsStore, granted: bool) {
    store.set(keys::NOTIF_ALLOWED, Value::Bool(granted));
    store.set(keys::NOTIF_BLOCKED, Value::Bool(!granted));
}

pub fn record_notification_prompt_time(store: &dyn SettingsStore, at: DateTime<Utc>) {
    store.set(keys::NOTIF_PROMPT_TIMESTAMP, epoch_millis(at));
}

pub fn persist_attribution(store: &dyn SettingsStore, record: &AttributionRecord) {
    store.set(
        keys::ATTRIBUTION_BACKUP,
        Value::Object(record.fields().clone()),
    );
}

pub fn load_attribution_backup(store: &dyn SettingsStore) -> Option<AttributionRecord> {
    store
        .get(keys::ATTRIBUTION_BACKUP)
        .and_then(AttributionRecord::from_value)
}

pub fn persist_deeplink(store: &dyn SettingsStore, record: &DeepLinkRecord) {
    match serde_json::to_vec(record) {
        Ok(raw) => store.set(keys::DEEPLINK_BACKUP, Value::from(obfuscate(&raw))),
        Err(e) => tracing::warn!("Failed to encode deep-link backup: {}", e),
    }
}

pub fn load_deeplink_backup(store: &dyn SettingsStore) -> Option<DeepLinkRecord> {
    let encoded = store.get_str(keys::DEEPLINK_BACKUP)?;
    let raw = deobfuscate(&encoded)?;
    serde_json::from_slice::<Value>(&raw)
        .ok()
        .and_then(DeepLinkRecord::from_value)
}

fn obfuscate(raw: &[u8]) -> String {
    STANDARD.encode(raw).replace('=', "~").replace('+', ".")
}

fn deobfuscate(encoded: &str) -> Option<Vec<u8>> {
    let restored = encoded.replace('~', "=").replace('.', "+");
    STANDARD.decode(restored).ok()
}

pub fn persist_temporary_url(store: &dyn SettingsStore, url: &str, at: DateTime<Utc>) {
    store.set(keys::TEMP_REDIRECT_URL, Value::from(url));
    store.set(keys::TEMP_REDIRECT_URL_TIME, epoch_millis(at));
}

pub fn temporary_url(store: &dyn SettingsStore) -> Option<String> {
    store
        .get_str(keys::TEMP_REDIRECT_URL)
        .filter(|url| !url.trim().is_empty())
}

pub fn persist_push_token(store: &dyn SettingsStore, token: &str, at: DateTime<Utc>) {
    store.set(keys::PUSH_TOKEN, Value::from(token));
    store.set(keys::PUSH_TOKEN_TIME, epoch_millis(at));
}

pub fn push_token(store: &dyn SettingsStore) -> Option<String> {
    store.get_str(keys::PUSH_TOKEN)
}

/// Return the persisted device id, generating and persisting one when absent.
pub fn device_id_or_generate(store: &dyn SettingsStore) -> String {
    if let Some(id) = store
        .get_str(keys::DEVICE_ID)
        .filter(|id| !id.trim().is_empty())
    {
        return id;
    }
    let id = uuid::Uuid::new_v4().to_string().to_uppercase();
    store.set(keys::DEVICE_ID, Value::from(id.as_str()));
    id
}
