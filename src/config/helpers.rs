use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an env var. Unset and blank values are both `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid UTF-8".to_string(),
        }),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse: {e}"),
        })
}

/// Millisecond duration from env, falling back to `fallback`. Zero is rejected.
pub(crate) fn duration_ms(key: &str, fallback: u64) -> Result<Duration, ConfigError> {
    let ms = parse_optional_env::<u64>(key)?.unwrap_or(fallback);
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be > 0".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

/// Comma-separated millisecond list, e.g. `2000,4000,8000`.
pub(crate) fn parse_ms_list(key: &str, raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{part}' is not a millisecond count: {e}"),
                })
        })
        .collect()
}
