//! Configuration for launchgate.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `./.env` and `~/.launchgate/.env` are loaded into the environment first
//! (see [`crate::bootstrap::load_launchgate_env`]). The TOML file defaults to
//! `~/.launchgate/config.toml`.

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::resolver::{DEFAULT_ATTRIBUTION_BASE_URL, DEFAULT_INTERVALS, DeviceProfile, normalize_locale};
use crate::settings::FileSettingsStore;

pub use crate::resolver::ProviderConfig;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_DEADLINE_MS: u64 = 30_000;
const DEFAULT_ENRICHMENT_GRACE_MS: u64 = 5_000;
const DEFAULT_MERGE_DEBOUNCE_MS: u64 = 2_500;
const DEFAULT_PUSH_SIGNAL_DELAY_MS: u64 = 2_500;
const DEFAULT_PROBE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;

/// Main configuration for a bootstrap run.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub device: DeviceConfig,
    pub timings: Timings,
    pub store: StoreConfig,
    pub probe: Option<ProbeConfig>,
}

/// Device identity. The id is generated and persisted when not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: Option<String>,
    pub bundle_id: String,
    pub os: String,
    pub locale: String,
    pub firebase_project_id: Option<String>,
}

impl DeviceConfig {
    pub fn into_profile(self, device_id: String) -> DeviceProfile {
        DeviceProfile {
            device_id,
            bundle_id: self.bundle_id,
            os: self.os,
            locale: self.locale,
            firebase_project_id: self.firebase_project_id,
        }
    }
}

/// Timing contract of the bootstrap flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub deadline: Duration,
    pub enrichment_grace: Duration,
    pub merge_debounce: Duration,
    pub push_signal_delay: Duration,
    pub retry_intervals: Vec<Duration>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(DEFAULT_DEADLINE_MS),
            enrichment_grace: Duration::from_millis(DEFAULT_ENRICHMENT_GRACE_MS),
            merge_debounce: Duration::from_millis(DEFAULT_MERGE_DEBOUNCE_MS),
            push_signal_delay: Duration::from_millis(DEFAULT_PUSH_SIGNAL_DELAY_MS),
            retry_intervals: DEFAULT_INTERVALS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// TCP reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub target: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// On-disk TOML layout. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub provider: FileProvider,
    pub device: FileDevice,
    pub timings: FileTimings,
    pub store: FileStore,
    pub probe: FileProbe,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileProvider {
    pub attribution_base_url: Option<String>,
    pub app_id: Option<String>,
    pub dev_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub verification_url: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDevice {
    pub device_id: Option<String>,
    pub bundle_id: Option<String>,
    pub os: Option<String>,
    pub locale: Option<String>,
    pub firebase_project_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTimings {
    pub deadline_ms: Option<u64>,
    pub enrichment_grace_ms: Option<u64>,
    pub merge_debounce_ms: Option<u64>,
    pub push_signal_delay_ms: Option<u64>,
    pub retry_intervals_ms: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStore {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileProbe {
    pub target: Option<String>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl FileConfig {
    /// Default TOML config file path (~/.launchgate/config.toml).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".launchgate")
            .join("config.toml")
    }

    /// Load a TOML file. Returns `None` if the file doesn't exist and an
    /// error only if it exists but can't be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        toml::from_str(&data)
            .map(Some)
            .map_err(|e| ConfigError::ParseError(format!("invalid TOML in {}: {}", path.display(), e)))
    }

    fn load_or_default(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        match Self::load(&path)? {
            Some(file) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(file)
            }
            None => {
                if explicit_path.is_some() {
                    tracing::warn!("Config file {} not found, using defaults", path.display());
                }
                Ok(Self::default())
            }
        }
    }
}

impl Config {
    /// Load env files, overlay the TOML file and resolve the full config.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_launchgate_env();
        let file = FileConfig::load_or_default(toml_path)?;
        Self::resolve(&file)
    }

    /// Resolve env vars over `file` over defaults.
    pub fn resolve(file: &FileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            provider: resolve_provider(&file.provider)?,
            device: resolve_device(&file.device)?,
            timings: resolve_timings(&file.timings)?,
            store: StoreConfig::resolve(&file.store)?,
            probe: resolve_probe(&file.probe)?,
        })
    }
}

impl StoreConfig {
    pub fn resolve(file: &FileStore) -> Result<Self, ConfigError> {
        let path = helpers::optional_env("LAUNCHGATE_SETTINGS_PATH")?
            .map(PathBuf::from)
            .or_else(|| file.path.clone())
            .unwrap_or_else(FileSettingsStore::default_path);
        Ok(Self { path })
    }

    /// Store location without requiring provider settings.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_launchgate_env();
        let file = FileConfig::load_or_default(toml_path)?;
        Self::resolve(&file.store)
    }
}

fn required(key: &str, value: Option<String>, hint: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

fn validate_url(key: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("not a valid URL: {e}"),
        })
}

fn resolve_provider(file: &FileProvider) -> Result<ProviderConfig, ConfigError> {
    let attribution_base_url = helpers::optional_env("LAUNCHGATE_ATTRIBUTION_BASE_URL")?
        .or_else(|| file.attribution_base_url.clone())
        .unwrap_or_else(|| DEFAULT_ATTRIBUTION_BASE_URL.to_string());
    validate_url("LAUNCHGATE_ATTRIBUTION_BASE_URL", &attribution_base_url)?;

    let app_id = required(
        "LAUNCHGATE_APP_ID",
        helpers::optional_env("LAUNCHGATE_APP_ID")?.or_else(|| file.app_id.clone()),
        "Set the numeric store app id (without the 'id' prefix).",
    )?;
    let dev_key = required(
        "LAUNCHGATE_DEV_KEY",
        helpers::optional_env("LAUNCHGATE_DEV_KEY")?.or_else(|| file.dev_key.clone()),
        "Set the attribution provider dev key.",
    )?;
    let endpoint_url = required(
        "LAUNCHGATE_ENDPOINT_URL",
        helpers::optional_env("LAUNCHGATE_ENDPOINT_URL")?.or_else(|| file.endpoint_url.clone()),
        "Set the endpoint provider URL the resolution POST goes to.",
    )?;
    validate_url("LAUNCHGATE_ENDPOINT_URL", &endpoint_url)?;

    let verification_url =
        helpers::optional_env("LAUNCHGATE_VERIFICATION_URL")?.or_else(|| file.verification_url.clone());
    if let Some(url) = &verification_url {
        validate_url("LAUNCHGATE_VERIFICATION_URL", url)?;
    }

    let request_timeout = helpers::duration_ms(
        "LAUNCHGATE_REQUEST_TIMEOUT_MS",
        file.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
    )?;

    Ok(ProviderConfig {
        attribution_base_url,
        app_id,
        dev_key: SecretString::from(dev_key),
        endpoint_url,
        verification_url,
        request_timeout,
    })
}

fn resolve_device(file: &FileDevice) -> Result<DeviceConfig, ConfigError> {
    let raw_locale = match helpers::optional_env("LAUNCHGATE_LOCALE")?.or_else(|| file.locale.clone()) {
        Some(locale) => Some(locale),
        None => helpers::optional_env("LANG")?,
    };

    Ok(DeviceConfig {
        device_id: helpers::optional_env("LAUNCHGATE_DEVICE_ID")?.or_else(|| file.device_id.clone()),
        bundle_id: helpers::optional_env("LAUNCHGATE_BUNDLE_ID")?
            .or_else(|| file.bundle_id.clone())
            .unwrap_or_default(),
        os: helpers::optional_env("LAUNCHGATE_OS")?
            .or_else(|| file.os.clone())
            .unwrap_or_else(|| "iOS".to_string()),
        locale: normalize_locale(raw_locale.as_deref()),
        firebase_project_id: helpers::optional_env("LAUNCHGATE_FIREBASE_PROJECT_ID")?
            .or_else(|| file.firebase_project_id.clone()),
    })
}

fn resolve_timings(file: &FileTimings) -> Result<Timings, ConfigError> {
    let retry_intervals = match helpers::optional_env("LAUNCHGATE_RETRY_INTERVALS_MS")? {
        Some(raw) => helpers::parse_ms_list("LAUNCHGATE_RETRY_INTERVALS_MS", &raw)?,
        None => match &file.retry_intervals_ms {
            Some(list) => list.iter().copied().map(Duration::from_millis).collect(),
            None => DEFAULT_INTERVALS.to_vec(),
        },
    };

    Ok(Timings {
        deadline: helpers::duration_ms(
            "LAUNCHGATE_DEADLINE_MS",
            file.deadline_ms.unwrap_or(DEFAULT_DEADLINE_MS),
        )?,
        enrichment_grace: helpers::duration_ms(
            "LAUNCHGATE_ENRICHMENT_GRACE_MS",
            file.enrichment_grace_ms.unwrap_or(DEFAULT_ENRICHMENT_GRACE_MS),
        )?,
        merge_debounce: helpers::duration_ms(
            "LAUNCHGATE_MERGE_DEBOUNCE_MS",
            file.merge_debounce_ms.unwrap_or(DEFAULT_MERGE_DEBOUNCE_MS),
        )?,
        push_signal_delay: helpers::duration_ms(
            "LAUNCHGATE_PUSH_SIGNAL_DELAY_MS",
            file.push_signal_delay_ms.unwrap_or(DEFAULT_PUSH_SIGNAL_DELAY_MS),
        )?,
        retry_intervals,
    })
}

fn resolve_probe(file: &FileProbe) -> Result<Option<ProbeConfig>, ConfigError> {
    let Some(target) = helpers::optional_env("LAUNCHGATE_PROBE_TARGET")?.or_else(|| file.target.clone()) else {
        return Ok(None);
    };
    Ok(Some(ProbeConfig {
        target,
        interval: helpers::duration_ms(
            "LAUNCHGATE_PROBE_INTERVAL_MS",
            file.interval_ms.unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
        )?,
        timeout: helpers::duration_ms(
            "LAUNCHGATE_PROBE_TIMEOUT_MS",
            file.timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        )?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "LAUNCHGATE_ATTRIBUTION_BASE_URL",
        "LAUNCHGATE_APP_ID",
        "LAUNCHGATE_DEV_KEY",
        "LAUNCHGATE_ENDPOINT_URL",
        "LAUNCHGATE_VERIFICATION_URL",
        "LAUNCHGATE_REQUEST_TIMEOUT_MS",
        "LAUNCHGATE_DEVICE_ID",
        "LAUNCHGATE_BUNDLE_ID",
        "LAUNCHGATE_OS",
        "LAUNCHGATE_LOCALE",
        "LAUNCHGATE_FIREBASE_PROJECT_ID",
        "LAUNCHGATE_DEADLINE_MS",
        "LAUNCHGATE_ENRICHMENT_GRACE_MS",
        "LAUNCHGATE_MERGE_DEBOUNCE_MS",
        "LAUNCHGATE_PUSH_SIGNAL_DELAY_MS",
        "LAUNCHGATE_RETRY_INTERVALS_MS",
        "LAUNCHGATE_SETTINGS_PATH",
        "LAUNCHGATE_PROBE_TARGET",
        "LAUNCHGATE_PROBE_INTERVAL_MS",
        "LAUNCHGATE_PROBE_TIMEOUT_MS",
        "LANG",
    ];

    fn clear_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            for key in KEYS {
                std::env::remove_var(key);
            }
        }
    }

    fn file_with_required() -> FileConfig {
        FileConfig {
            provider: FileProvider {
                app_id: Some("123456".to_string()),
                dev_key: Some("file-key".to_string()),
                endpoint_url: Some("https://config.example/config.php".to_string()),
                ..FileProvider::default()
            },
            ..FileConfig::default()
        }
    }

    #[test]
    fn test_defaults_apply_over_minimal_file() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = Config::resolve(&file_with_required()).expect("resolve");
        assert_eq!(config.provider.attribution_base_url, DEFAULT_ATTRIBUTION_BASE_URL);
        assert_eq!(config.provider.request_timeout, Duration::from_secs(30));
        assert_eq!(config.provider.verification_url, None);
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.device.os, "iOS");
        assert_eq!(config.device.locale, "EN");
        assert_eq!(config.device.device_id, None);
        assert_eq!(config.probe, None);
    }

    #[test]
    fn test_env_wins_over_file() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LAUNCHGATE_DEV_KEY", "env-key");
            std::env::set_var("LAUNCHGATE_DEADLINE_MS", "12000");
            std::env::set_var("LAUNCHGATE_RETRY_INTERVALS_MS", "100,200");
            std::env::set_var("LAUNCHGATE_LOCALE", "de-AT");
            std::env::set_var("LAUNCHGATE_PROBE_TARGET", "1.1.1.1:443");
        }

        let mut file = file_with_required();
        file.timings.deadline_ms = Some(99_000);
        let config = Config::resolve(&file).expect("resolve");
        clear_env();

        assert_eq!(config.provider.dev_key.expose_secret(), "env-key");
        assert_eq!(config.timings.deadline, Duration::from_secs(12));
        assert_eq!(
            config.timings.retry_intervals,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(config.device.locale, "DE");
        let probe = config.probe.expect("probe configured");
        assert_eq!(probe.target, "1.1.1.1:443");
        assert_eq!(probe.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_required_value() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let err = Config::resolve(&FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "LAUNCHGATE_APP_ID"));
    }

    #[test]
    fn test_invalid_override_is_reported() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LAUNCHGATE_DEADLINE_MS", "soon");
        }
        let err = Config::resolve(&file_with_required()).unwrap_err();
        clear_env();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LAUNCHGATE_DEADLINE_MS"));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        let mut file = file_with_required();
        file.timings.enrichment_grace_ms = Some(0);
        assert!(Config::resolve(&file).is_err());
    }

    #[test]
    fn test_malformed_endpoint_url() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        let mut file = file_with_required();
        file.provider.endpoint_url = Some("config.php".to_string());
        assert!(matches!(
            Config::resolve(&file),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_toml_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[provider]
app_id = "42"
dev_key = "k"
endpoint_url = "https://config.example/"

[timings]
retry_intervals_ms = [10, 20, 30]

[store]
path = "/tmp/launchgate-settings.json"
"#,
        )
        .unwrap();

        let file = FileConfig::load(&path).unwrap().expect("file exists");
        assert_eq!(file.provider.app_id.as_deref(), Some("42"));
        assert_eq!(file.timings.retry_intervals_ms, Some(vec![10, 20, 30]));
        assert_eq!(
            file.store.path,
            Some(PathBuf::from("/tmp/launchgate-settings.json"))
        );

        assert_eq!(FileConfig::load(&dir.path().join("missing.toml")).unwrap(), None);

        std::fs::write(&path, "provider = 5").unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_store_path_layering() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        let file = FileStore {
            path: Some(PathBuf::from("/tmp/a.json")),
        };
        assert_eq!(StoreConfig::resolve(&file).unwrap().path, PathBuf::from("/tmp/a.json"));

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("LAUNCHGATE_SETTINGS_PATH", "/tmp/b.json");
        }
        let resolved = StoreConfig::resolve(&file).unwrap();
        clear_env();
        assert_eq!(resolved.path, PathBuf::from("/tmp/b.json"));
    }
}
