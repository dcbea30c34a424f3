//! HTTP tests for the attribution provider, endpoint provider and remote
//! verification read, against a local axum server.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};

use launchgate::error::ResolverError;
use launchgate::resolver::{DeviceProfile, EndpointResolver, HttpEndpointResolver, ProviderConfig, RetrySchedule};
use launchgate::settings::{self, MemorySettingsStore, SettingsStore};
use launchgate::verification::{RemoteValueGate, VerificationGate};
use launchgate::AttributionRecord;

#[derive(Default)]
struct Provider {
    attribution_status: Mutex<Option<u16>>,
    attribution_requests: Mutex<Vec<(String, HashMap<String, String>)>>,
    endpoint_script: Mutex<VecDeque<(u16, Value)>>,
    endpoint_bodies: Mutex<Vec<Value>>,
    verification: Mutex<Option<(u16, Value)>>,
}

async fn attribution_handler(
    State(provider): State<Arc<Provider>>,
    Path(app): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    provider
        .attribution_requests
        .lock()
        .unwrap()
        .push((app, query));
    let status = provider.attribution_status.lock().unwrap().unwrap_or(200);
    (
        StatusCode::from_u16(status).unwrap(),
        Json(json!({"af_status": "Non-organic", "media_source": "fetched"})),
    )
}

async fn endpoint_handler(State(provider): State<Arc<Provider>>, Json(body): Json<Value>) -> impl IntoResponse {
    provider.endpoint_bodies.lock().unwrap().push(body);
    let (status, reply) = provider
        .endpoint_script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((200, json!({"ok": true, "url": "https://dest.example/default"})));
    (StatusCode::from_u16(status).unwrap(), Json(reply))
}

async fn verification_handler(State(provider): State<Arc<Provider>>) -> impl IntoResponse {
    let (status, value) = provider
        .verification
        .lock()
        .unwrap()
        .clone()
        .unwrap_or((200, Value::Null));
    (StatusCode::from_u16(status).unwrap(), Json(value))
}

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("Operation not permitted")
        || err.to_string().contains("Permission denied")
        || err.to_string().contains("failed to bind")
}

async fn start_test_server(provider: Arc<Provider>) -> Option<SocketAddr> {
    let app = Router::new()
        .route("/install_data/v4.0/{app}", get(attribution_handler))
        .route("/config.php", post(endpoint_handler))
        .route("/users/log/data.json", get(verification_handler))
        .with_state(provider);

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return None,
        Err(e) => panic!("Failed to start test server: {e:?}"),
    };
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Some(addr)
}

fn resolver_for(addr: SocketAddr, store: Arc<MemorySettingsStore>) -> HttpEndpointResolver {
    HttpEndpointResolver::new(
        ProviderConfig {
            attribution_base_url: format!("http://{addr}"),
            app_id: "123456".to_string(),
            dev_key: SecretString::from("dev-key".to_string()),
            endpoint_url: format!("http://{addr}/config.php"),
            verification_url: None,
            request_timeout: Duration::from_secs(5),
        },
        DeviceProfile {
            device_id: "DEVICE-1".to_string(),
            bundle_id: "com.example.app".to_string(),
            os: "iOS".to_string(),
            locale: "EN".to_string(),
            firebase_project_id: Some("998877".to_string()),
        },
        store,
        RetrySchedule::new(vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ]),
    )
}

fn paid() -> AttributionRecord {
    AttributionRecord::from_value(json!({"af_status": "Non-organic", "campaign": "spring"})).unwrap()
}

#[tokio::test]
async fn fetch_attribution_sends_store_id_and_credentials() {
    let provider = Arc::new(Provider::default());
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let record = resolver.fetch_attribution("DEVICE-1").await.unwrap();
    assert_eq!(record.get("media_source"), Some(&json!("fetched")));

    let requests = provider.attribution_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (app, query) = &requests[0];
    assert_eq!(app, "id123456");
    assert_eq!(query.get("devkey").map(String::as_str), Some("dev-key"));
    assert_eq!(query.get("device_id").map(String::as_str), Some("DEVICE-1"));
}

#[tokio::test]
async fn fetch_attribution_failure_is_terminal() {
    let provider = Arc::new(Provider::default());
    *provider.attribution_status.lock().unwrap() = Some(503);
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let err = resolver.fetch_attribution("DEVICE-1").await.unwrap_err();
    assert!(matches!(err, ResolverError::HttpStatus { status: 503 }));
    assert_eq!(provider.attribution_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn resolve_endpoint_posts_device_fields_and_push_token() {
    let provider = Arc::new(Provider::default());
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let store = Arc::new(MemorySettingsStore::new());
    let resolver = resolver_for(addr, store.clone());
    // Recorded after construction; read at call time.
    settings::persist_push_token(store.as_ref(), "push-abc", chrono::Utc::now());

    let endpoint = resolver.resolve_endpoint(&paid()).await.unwrap();
    assert_eq!(endpoint, "https://dest.example/default");

    let bodies = provider.endpoint_bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["campaign"], json!("spring"));
    assert_eq!(body["os"], json!("iOS"));
    assert_eq!(body["device_id"], json!("DEVICE-1"));
    assert_eq!(body["bundle_id"], json!("com.example.app"));
    assert_eq!(body["store_id"], json!("id123456"));
    assert_eq!(body["firebase_project_id"], json!("998877"));
    assert_eq!(body["push_token"], json!("push-abc"));
    assert_eq!(body["locale"], json!("EN"));
}

#[tokio::test]
async fn rate_limited_attempts_retry_until_success() {
    let provider = Arc::new(Provider::default());
    provider.endpoint_script.lock().unwrap().extend([
        (429, json!({})),
        (429, json!({})),
        (200, json!({"ok": true, "url": "https://dest.example/after-429"})),
    ]);
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let endpoint = resolver.resolve_endpoint(&paid()).await.unwrap();
    assert_eq!(endpoint, "https://dest.example/after-429");
    assert_eq!(provider.endpoint_bodies.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn rate_limited_every_time_exhausts_four_attempts() {
    let provider = Arc::new(Provider::default());
    provider
        .endpoint_script
        .lock()
        .unwrap()
        .extend(std::iter::repeat_n((429, json!({})), 6));
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let store = Arc::new(MemorySettingsStore::new());
    let resolver = resolver_for(addr, store);

    let err = resolver.resolve_endpoint(&paid()).await.unwrap_err();
    assert!(matches!(err, ResolverError::RateLimited { attempts: 4 }));
    assert_eq!(provider.endpoint_bodies.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn server_error_is_not_retried() {
    let provider = Arc::new(Provider::default());
    provider
        .endpoint_script
        .lock()
        .unwrap()
        .push_back((500, json!({"ok": true, "url": "https://ignored"})));
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let err = resolver.resolve_endpoint(&paid()).await.unwrap_err();
    assert!(matches!(err, ResolverError::HttpStatus { status: 500 }));
    assert_eq!(provider.endpoint_bodies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unsuccessful_body_is_retried() {
    let provider = Arc::new(Provider::default());
    provider.endpoint_script.lock().unwrap().extend([
        (200, json!({"ok": false})),
        (200, json!({"ok": true, "url": "https://dest.example/after-retry"})),
    ]);
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let endpoint = resolver.resolve_endpoint(&paid()).await.unwrap();
    assert_eq!(endpoint, "https://dest.example/after-retry");
    assert_eq!(provider.endpoint_bodies.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn unsuccessful_body_every_time_surfaces_parse_failure() {
    let provider = Arc::new(Provider::default());
    provider
        .endpoint_script
        .lock()
        .unwrap()
        .extend(std::iter::repeat_n((200, json!({"ok": false, "url": "https://dest"})), 6));
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let resolver = resolver_for(addr, Arc::new(MemorySettingsStore::new()));

    let err = resolver.resolve_endpoint(&paid()).await.unwrap_err();
    assert!(matches!(err, ResolverError::Parse(_)));
    assert_eq!(provider.endpoint_bodies.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn unreachable_endpoint_provider_retries_then_fails() {
    let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
    // Port 9 (discard) on loopback refuses connections.
    let resolver = HttpEndpointResolver::new(
        ProviderConfig {
            attribution_base_url: "http://127.0.0.1:9".to_string(),
            app_id: "1".to_string(),
            dev_key: SecretString::from("k".to_string()),
            endpoint_url: "http://127.0.0.1:9/config.php".to_string(),
            verification_url: None,
            request_timeout: Duration::from_secs(2),
        },
        DeviceProfile {
            device_id: "D".to_string(),
            bundle_id: String::new(),
            os: "iOS".to_string(),
            locale: "EN".to_string(),
            firebase_project_id: None,
        },
        store,
        RetrySchedule::new(vec![Duration::from_millis(5); 3]),
    );

    let err = resolver.resolve_endpoint(&paid()).await.unwrap_err();
    assert!(err.is_transient(), "expected a transport failure, got {err:?}");
}

#[tokio::test]
async fn remote_value_gate_applies_url_rule() {
    let provider = Arc::new(Provider::default());
    let Some(addr) = start_test_server(provider.clone()).await else {
        eprintln!("Skipping: cannot bind test server");
        return;
    };
    let gate = RemoteValueGate::new(format!("http://{addr}/users/log/data.json"), Duration::from_secs(5));

    *provider.verification.lock().unwrap() = Some((200, json!("https://dest.example/verified")));
    assert!(gate.verify().await.unwrap());

    *provider.verification.lock().unwrap() = Some((200, json!("")));
    assert!(!gate.verify().await.unwrap());

    *provider.verification.lock().unwrap() = Some((200, Value::Null));
    assert!(!gate.verify().await.unwrap());

    *provider.verification.lock().unwrap() = Some((503, json!("https://dest")));
    assert!(gate.verify().await.is_err());
}
