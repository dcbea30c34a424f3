//! Attribution enrichment and endpoint resolution over HTTP.

mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::retry::{AttemptOutcome, DEFAULT_INTERVALS, RetrySchedule, run_with_retry};

use crate::attribution::AttributionRecord;
use crate::error::ResolverError;
use crate::settings::{self, SettingsStore};

/// Default attribution provider base URL.
pub const DEFAULT_ATTRIBUTION_BASE_URL: &str = "https://gcdsdk.appsflyer.com";

const USER_AGENT: &str = concat!("launchgate/", env!("CARGO_PKG_VERSION"));

/// Remote collaborators of the resolution flow.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Fetch attribution for a device. Single attempt; any failure is terminal.
    async fn fetch_attribution(&self, device_id: &str) -> Result<AttributionRecord, ResolverError>;

    /// Resolve the destination endpoint for an attribution record.
    async fn resolve_endpoint(&self, attribution: &AttributionRecord) -> Result<String, ResolverError>;
}

/// Provider endpoints and credentials.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub attribution_base_url: String,
    pub app_id: String,
    pub dev_key: SecretString,
    pub endpoint_url: String,
    /// Remote verification value read by the gate. `None` skips the network
    /// read and treats verification as failed.
    pub verification_url: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn store_id(&self) -> String {
        format!("id{}", self.app_id)
    }
}

/// Device identity fields sent with every resolution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_id: String,
    pub bundle_id: String,
    pub os: String,
    pub locale: String,
    pub firebase_project_id: Option<String>,
}

/// Two-letter upper-case language code from a locale tag, `EN` when absent.
pub fn normalize_locale(raw: Option<&str>) -> String {
    let prefix: String = raw
        .map(str::trim)
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .take(2)
        .collect();
    if prefix.len() == 2 {
        prefix.to_ascii_uppercase()
    } else {
        "EN".to_string()
    }
}

/// Build the resolution request body.
///
/// Attribution fields come first; device fields are written over them.
pub fn build_endpoint_payload(
    attribution: &AttributionRecord,
    device: &DeviceProfile,
    store_id: &str,
    push_token: Option<&str>,
) -> Map<String, Value> {
    let mut payload = attribution.fields().clone();
    payload.insert("os".to_string(), Value::from(device.os.as_str()));
    payload.insert("device_id".to_string(), Value::from(device.device_id.as_str()));
    payload.insert("af_id".to_string(), Value::from(device.device_id.as_str()));
    payload.insert("bundle_id".to_string(), Value::from(device.bundle_id.as_str()));
    if let Some(project) = &device.firebase_project_id {
        payload.insert("firebase_project_id".to_string(), Value::from(project.as_str()));
    }
    payload.insert("store_id".to_string(), Value::from(store_id));
    payload.insert(
        "push_token".to_string(),
        push_token.map(Value::from).unwrap_or(Value::Null),
    );
    payload.insert("locale".to_string(), Value::from(device.locale.as_str()));
    payload
}

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    ok: Option<bool>,
    url: Option<Value>,
}

/// Parse `{ "ok": true, "url": "..." }`. Anything else is a parse failure.
pub fn parse_endpoint_response(body: &str) -> Result<String, ResolverError> {
    let response: EndpointResponse =
        serde_json::from_str(body).map_err(|e| ResolverError::Parse(e.to_string()))?;
    match (response.ok, response.url) {
        (Some(true), Some(Value::String(url))) => Ok(url),
        (Some(false), _) => Err(ResolverError::Parse("provider reported ok=false".to_string())),
        (None, _) => Err(ResolverError::Parse("missing ok flag".to_string())),
        (Some(true), _) => Err(ResolverError::Parse("missing url string".to_string())),
    }
}

/// Build the attribution provider URL for a device.
pub fn attribution_url(providers: &ProviderConfig, device_id: &str) -> Result<url::Url, ResolverError> {
    let base = providers.attribution_base_url.trim_end_matches('/');
    let raw = format!("{base}/install_data/v4.0/{}", providers.store_id());
    let mut url = url::Url::parse(&raw).map_err(|e| ResolverError::MalformedUrl(format!("{raw}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("devkey", providers.dev_key.expose_secret())
        .append_pair("device_id", device_id);
    Ok(url)
}

/// Resolver backed by the attribution and endpoint providers.
#[derive(Clone)]
pub struct HttpEndpointResolver {
    client: Client,
    providers: ProviderConfig,
    device: DeviceProfile,
    store: Arc<dyn SettingsStore>,
    schedule: RetrySchedule,
}

impl HttpEndpointResolver {
    pub fn new(
        providers: ProviderConfig,
        device: DeviceProfile,
        store: Arc<dyn SettingsStore>,
        schedule: RetrySchedule,
    ) -> Self {
        let client = Client::builder()
            .timeout(providers.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            providers,
            device,
            store,
            schedule,
        }
    }

    async fn post_once(&self, body: &[u8]) -> AttemptOutcome<String> {
        let response = match self
            .client
            .post(&self.providers.endpoint_url)
            .header("Content-Type", "application/json")
            .body(body.to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Failed(ResolverError::Transport(e)),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return AttemptOutcome::RateLimited;
        }
        if !status.is_success() {
            return AttemptOutcome::Failed(ResolverError::HttpStatus {
                status: status.as_u16(),
            });
        }

        match response.text().await {
            Ok(text) => match parse_endpoint_response(&text) {
                Ok(url) => AttemptOutcome::Success(url),
                Err(e) => AttemptOutcome::Failed(e),
            },
            Err(e) => AttemptOutcome::Failed(ResolverError::Transport(e)),
        }
    }
}

impl std::fmt::Debug for HttpEndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEndpointResolver")
            .field("endpoint_url", &self.providers.endpoint_url)
            .field("device", &self.device)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EndpointResolver for HttpEndpointResolver {
    async fn fetch_attribution(&self, device_id: &str) -> Result<AttributionRecord, ResolverError> {
        let url = attribution_url(&self.providers, device_id)?;
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolverError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ResolverError::Parse(e.to_string()))?;
        AttributionRecord::from_value(value)
            .ok_or_else(|| ResolverError::Parse("attribution body is not an object".to_string()))
    }

    async fn resolve_endpoint(&self, attribution: &AttributionRecord) -> Result<String, ResolverError> {
        // Read at call time: the token may arrive after the resolver is built.
        let push_token = settings::push_token(self.store.as_ref());
        let payload = build_endpoint_payload(
            attribution,
            &self.device,
            &self.providers.store_id(),
            push_token.as_deref(),
        );
        let body = serde_json::to_vec(&payload)?;

        let endpoint = run_with_retry(&self.schedule, |_| self.post_once(&body)).await?;
        tracing::info!("Endpoint resolved");
        Ok(endpoint)
    }
}
