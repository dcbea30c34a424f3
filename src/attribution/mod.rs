//! Attribution and deep-link records.
//!
//! Both records are opaque JSON objects delivered by the attribution SDK.
//! Only two fields carry meaning here: the install status that marks an
//! organic install, and the deep-link fields that are folded into the
//! attribution payload before endpoint resolution.

mod merger;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::merger::{AttributionMerger, DEFAULT_MERGE_DEBOUNCE};

/// Attribution field holding the install status.
pub const STATUS_FIELD: &str = "af_status";

/// Status value marking an install with no campaign behind it.
pub const ORGANIC_STATUS: &str = "Organic";

/// Prefix applied to deep-link keys when folded into attribution by the merger.
pub const DEEP_LINK_KEY_PREFIX: &str = "deep_";

/// Install attribution payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributionRecord(Map<String, Value>);

impl AttributionRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value. Anything other than an object is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Record delivered in place of attribution when the SDK reports failure.
    pub fn failure(reason: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::Bool(true));
        fields.insert(
            "error_description".to_string(),
            Value::String(reason.into()),
        );
        Self(fields)
    }

    pub fn has_data(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn is_organic_install(&self) -> bool {
        self.0.get(STATUS_FIELD).and_then(Value::as_str) == Some(ORGANIC_STATUS)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold deep-link fields into a copy of this record.
    ///
    /// Each deep-link key is inserted as `{prefix}{key}` only when that key is
    /// absent, so attribution always wins on collision. An empty prefix folds
    /// the keys in unchanged.
    pub fn merged_with_deep_link(&self, deeplink: &DeepLinkRecord, prefix: &str) -> Self {
        let mut merged = self.0.clone();
        for (key, value) in deeplink.fields() {
            let merged_key = format!("{prefix}{key}");
            merged.entry(merged_key).or_insert_with(|| value.clone());
        }
        Self(merged)
    }
}

impl From<Map<String, Value>> for AttributionRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Deep-link click payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeepLinkRecord(Map<String, Value>);

impl DeepLinkRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for DeepLinkRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
