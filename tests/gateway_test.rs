// ============================================================================
// Gateway Integration Tests
// ============================================================================
//
// Spins up the full router on an ephemeral port and drives it with a real
// HTTP client against wiremock upstreams: authentication, tenant header
// propagation, routing, failover, and public endpoint exemption.
//
// ============================================================================

use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tenant_gateway::config::{CircuitBreakerConfig, Config, HealthCheckConfig, RetryConfig};

const TEST_SECRET: &str = "integration-test-secret";

fn test_config(services: HashMap<String, Vec<String>>) -> Config {
    Config {
        port: 0,
        services,
        jwt_secret: Some(TEST_SECRET.to_string()),
        jwt_public_key: None,
        jwt_issuer: "my-auth-server".to_string(),
        jwt_audience: "api-gateway".to_string(),
        rate_limit: "1000 per minute".to_string(),
        retry: RetryConfig {
            upstream_timeout_secs: 2,
            max_subattempts: 0,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 50,
            success_threshold: 1,
            reset_timeout_secs: 30,
        },
        health_check: HealthCheckConfig {
            timeout_secs: 1,
            interval_secs: 3600,
        },
        rust_log: "info".to_string(),
    }
}

fn token(payload: serde_json::Value) -> String {
    encode(
        &Header::default(),
        &payload,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

fn valid_token() -> String {
    token(json!({
        "sub": "user-1",
        "profile": "tenant_a",
        "iss": "my-auth-server",
        "aud": "api-gateway",
        "exp": chrono::Utc::now().timestamp() + 3600,
    }))
}

/// Spawn the gateway on an ephemeral port, returning its address
async fn spawn_gateway(config: Config) -> SocketAddr {
    let (app, _health) = tenant_gateway::build_gateway(&config).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

#[tokio::test]
async fn test_missing_token_rejected_before_any_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::get(format!("http://{}/api/users/profile", addr))
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], "MISSING_TOKEN");
    // wiremock verifies expect(0) on drop: no upstream call happened
}

#[tokio::test]
async fn test_token_without_tenant_claim_is_403() {
    let upstream = MockServer::start().await;
    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let no_profile = token(json!({
        "sub": "user-1",
        "iss": "my-auth-server",
        "aud": "api-gateway",
        "exp": chrono::Utc::now().timestamp() + 3600,
    }));

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/users/profile", addr))
        .bearer_auth(no_profile)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], "MISSING_CLAIM");
}

#[tokio::test]
async fn test_authenticated_request_proxied_with_tenant_header() {
    let upstream = MockServer::start().await;
    // The mock only matches when the gateway injected the verified tenant
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("x-tenant-schema", "tenant_a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("profile-body"))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/users/profile", addr))
        .bearer_auth(valid_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "profile-body");
}

#[tokio::test]
async fn test_client_supplied_tenant_header_is_overwritten() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-tenant-schema", "tenant_a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    // The spoofed header must be replaced by the token's tenant
    let response = reqwest::Client::new()
        .get(format!("http://{}/api/users/profile", addr))
        .bearer_auth(valid_token())
        .header("x-tenant-schema", "tenant_evil")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let upstream = MockServer::start().await;
    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/payments/charge", addr))
        .bearer_auth(valid_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], "UNKNOWN_SERVICE");
}

#[tokio::test]
async fn test_failover_to_second_instance() {
    let live = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from-live"))
        .mount(&live)
        .await;

    // First instance in round-robin order refuses connections
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        vec!["http://127.0.0.1:1".to_string(), live.uri()],
    );
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/orders/items", addr))
        .bearer_auth(valid_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "from-live");
}

#[tokio::test]
async fn test_all_instances_down_is_502_all_failed() {
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        vec!["http://127.0.0.1:1".to_string()],
    );
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/orders/items", addr))
        .bearer_auth(valid_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error_code"], "ALL_UPSTREAMS_FAILED");
}

#[tokio::test]
async fn test_upstream_error_status_is_mirrored() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unprocessable"))
        .mount(&upstream)
        .await;

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/users/profile", addr))
        .bearer_auth(valid_token())
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    assert_eq!(response.text().await.unwrap(), "unprocessable");
}

#[tokio::test]
async fn test_health_and_metrics_exempt_from_auth() {
    let upstream = MockServer::start().await;
    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await.unwrap();
    assert!(body.get("services").is_some());

    let metrics = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
    assert_eq!(metrics.status(), 200);
}

#[tokio::test]
async fn test_query_string_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(wiremock::matchers::query_param("q", "alice"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut services = HashMap::new();
    services.insert("users".to_string(), vec![upstream.uri()]);
    let addr = spawn_gateway(test_config(services)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/api/users/search?q=alice", addr))
        .bearer_auth(valid_token())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}
