//! End-to-end runner tests against a mock HTTP service.

use std::io::Write;
use std::time::Duration;

use coordination::{Backend, ErrorKind, FinalStatus, JsonlTelemetry, Task};
use serde_json::json;
use tier_runner::{run, Args, HttpBackend};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(dir: &tempfile::TempDir, premium_url: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
max_cost = 5.0

[retry]
max_attempts = 3
initial_delay_ms = 1
max_delay_ms = 5
jitter = false

[[tiers]]
name = "cheap"
unit_price = 0.1
quality_threshold = 0.8

[[tiers.backends]]
id = "local"

[[tiers.signals]]
name = "confidence"
source = {{ kind = "numeric", pointer = "/confidence" }}

[[tiers]]
name = "premium"
unit_price = 1.0
quality_threshold = 0.8

[[tiers.backends]]
id = "cloud"

[[tiers.signals]]
name = "confidence"
source = {{ kind = "numeric", pointer = "/confidence" }}

[[endpoints]]
kind = "static"
id = "local"
payload = {{ confidence = 0.3, answer = "guess" }}
cost = 0.1

[[endpoints]]
kind = "http"
id = "cloud"
url = "{premium_url}"
cost_per_call = 1.0
"#
    );
    let path = dir.path().join("tiers.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(config.as_bytes()).unwrap();
    path
}

fn args_for(dir: &tempfile::TempDir, config: std::path::PathBuf) -> Args {
    Args {
        config,
        task_id: Some("task-1".into()),
        payload: Some(r#"{"question": "why"}"#.into()),
        payload_file: None,
        units: 1.0,
        telemetry: dir.path().join("telemetry.jsonl"),
        approve_escalation: false,
        seed: Some(1),
        json: false,
    }
}

#[tokio::test]
async fn test_escalates_to_http_tier_and_records_trace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(body_partial_json(json!({"task_id": "task-1", "payload": {"question": "why"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"payload": {"confidence": 0.95, "answer": "because"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, &format!("{}/run", server.uri()));
    let args = args_for(&dir, config);

    let report = run(&args, CancellationToken::new()).await.unwrap();
    assert_eq!(report.status, FinalStatus::Satisfied);
    assert_eq!(report.served_by_tier.as_deref(), Some("premium"));
    assert_eq!(report.payload["answer"], "because");
    assert_eq!(report.summary.escalations, 1);
    assert!((report.summary.total_cost - 1.1).abs() < 1e-9);
    assert_eq!(report.exit_code(), 0);

    let traces = JsonlTelemetry::new(&args.telemetry).read_all().unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].task_id, "task-1");
    assert_eq!(traces[0].tiers.len(), 2);
}

#[tokio::test]
async fn test_transient_http_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"confidence": 0.9})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, &format!("{}/run", server.uri()));
    let report = run(&args_for(&dir, config), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, FinalStatus::Satisfied);
    // one static call plus three HTTP attempts
    assert_eq!(report.summary.attempts, 4);
}

#[tokio::test]
async fn test_unreachable_premium_keeps_best_cheap_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, &format!("{}/run", server.uri()));
    let report = run(&args_for(&dir, config), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, FinalStatus::ExhaustedAllTiers);
    assert_eq!(report.served_by_tier.as_deref(), Some("cheap"));
    assert_eq!(report.payload["answer"], "guess");
    assert_eq!(report.exit_code(), 1);
    // auth errors are not retried
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_http_backend_classifies_status_and_sends_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/limited"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(
        "limited",
        format!("{}/limited", server.uri()),
        Some("secret".into()),
    )
    .unwrap();
    let err = backend
        .call(&Task::new("t", json!({})), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert!(err.message.contains("slow down"));
}

#[tokio::test]
async fn test_http_backend_slow_response_is_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let backend = HttpBackend::new("slow", server.uri(), None).unwrap();
    let err = backend
        .call(&Task::new("t", json!({})), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_http_backend_connection_refused() {
    // bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = HttpBackend::new("gone", format!("http://{addr}/run"), None).unwrap();
    let err = backend
        .call(&Task::new("t", json!({})), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionError);
}

#[tokio::test]
async fn test_missing_config_file_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let args = args_for(&dir, dir.path().join("nope.toml"));
    let err = run(&args, CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config"));
}
