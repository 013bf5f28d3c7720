//! Integration tests for the control router.
//!
//! HTTP calls go through `tower::ServiceExt::oneshot`; the schedule stream
//! is exercised over a real socket with tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use exp_master::api;
use exp_master::config::{SchedulerConfig, WorkerConfig};
use exp_master::datasets::DatasetDb;
use exp_master::repository::{ExperimentRepo, FilesystemBackend};
use exp_master::scheduler::{Scheduler, SchedulerDeps};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn start_scheduler(dir: &TempDir) -> Scheduler {
    let results_dir = dir.path().join("results");
    let config = SchedulerConfig {
        worker: WorkerConfig::with_program(env!("CARGO_BIN_EXE_exp_worker"))
            .with_term_timeout(Duration::from_millis(500))
            .with_env("EXP_RESULTS_DIR", results_dir.display().to_string()),
        results_dir,
        rid_cache: dir.path().join("last_rid.json"),
        submission_log: None,
    };
    Scheduler::start(
        config,
        SchedulerDeps {
            repository: Arc::new(ExperimentRepo::new(Arc::new(FilesystemBackend::new(
                dir.path().join("repository"),
            )))),
            datasets: Arc::new(DatasetDb::new()),
        },
    )
}

async fn call(scheduler: &Scheduler, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/scheduler")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = api::router(scheduler.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn get(scheduler: &Scheduler, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = api::router(scheduler.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);
    let (status, body) = get(&scheduler, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submit_and_inspect_schedule() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);

    let (status, reply) = call(
        &scheduler,
        json!({
            "method": "submit",
            "pipeline_name": "main",
            "expid": {"class_name": "Noop"},
            "priority": 2,
            "due_date": "2999-01-01T00:00:00Z"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["status"], "ok");
    let rid = reply["data"].as_u64().unwrap();

    let (_, schedule) = get(&scheduler, "/api/schedule").await;
    let entry = &schedule[rid.to_string()];
    assert_eq!(entry["pipeline"], "main");
    assert_eq!(entry["priority"], 2);
    assert_eq!(entry["status"], "pending");

    let (_, reply) = call(&scheduler, json!({"method": "get_status"})).await;
    assert_eq!(reply["data"][rid.to_string()]["status"], "pending");

    let (status, _) = call(&scheduler, json!({"method": "delete", "rid": rid})).await;
    assert_eq!(status, StatusCode::OK);
    let gone = timeout(TEST_TIMEOUT, async {
        while !scheduler.get_status().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok());
}

#[tokio::test]
async fn unknown_rid_is_not_found() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);

    let (status, reply) = call(&scheduler, json!({"method": "check_pause", "rid": 404})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reply["status"], "failed");

    // Deletion and termination of unknown runs are no-ops.
    let (status, _) = call(&scheduler, json!({"method": "delete", "rid": 404})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &scheduler,
        json!({"method": "request_termination", "rid": 404}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);

    let (status, _) = call(&scheduler, json!({"method": "reboot"})).await;
    assert!(status.is_client_error());

    let (status, _) = call(&scheduler, json!({"method": "submit"})).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn submissions_after_stop_are_unavailable() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);
    scheduler.stop().await;

    let (status, reply) = call(
        &scheduler,
        json!({"method": "submit", "expid": {"class_name": "Noop"}}),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply["status"], "failed");
}

#[tokio::test]
async fn ws_streams_schedule_modifications() {
    let dir = TempDir::new().unwrap();
    let scheduler = start_scheduler(&dir);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = api::router(scheduler.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");

    let sync = timeout(TEST_TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
    let sync = parse_ws_json(&sync);
    assert_eq!(sync["type"], "schedule_sync");
    assert_eq!(sync["schedule"], json!({}));

    let rid = scheduler
        .submit("main", exp_master::protocol::Expid::new("Noop"), 0, None, false)
        .await
        .unwrap();

    // Mirror the table from the stream until the run has come and gone.
    let mut mirror = json!({});
    let mut seen = Vec::new();
    let finished = timeout(TEST_TIMEOUT, async {
        while let Some(Ok(msg)) = ws.next().await {
            let msg = parse_ws_json(&msg);
            assert_eq!(msg["type"], "modification");
            let modification = serde_json::from_value::<exp_master::notifier::Modification>(
                msg["modification"].clone(),
            )
            .unwrap();
            modification.apply(&mut mirror);
            if let Some(status) = mirror[rid.to_string()]["status"].as_str() {
                seen.push(status.to_string());
            }
            if msg["modification"]["action"] == "delitem" {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "run never left the schedule");
    assert_eq!(mirror, json!({}));
    assert_eq!(seen.first().map(String::as_str), Some("pending"));
    assert!(seen.iter().any(|s| s == "running"));
    assert_eq!(seen.last().map(String::as_str), Some("deleting"));
}
