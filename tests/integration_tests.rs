//! Integration tests for StepFlow Monitor
//!
//! These drive the full stack (router -> engine -> store -> files -> hub)
//! against real `sh` child processes and a scratch storage root.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use stepflow::api::SharedState;
use stepflow::config::Config;
use stepflow::models::{Execution, ExecutionStatus, Step, StepStatus};
use stepflow::server::{build_state, http_app};

fn scratch_config(dir: &TempDir) -> Config {
    Config {
        storage_path: dir.path().to_path_buf(),
        ..Config::default()
    }
}

async fn test_state(dir: &TempDir) -> SharedState {
    build_state(scratch_config(dir)).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_json(
    state: &SharedState,
    path: &str,
    body: serde_json::Value,
) -> axum::response::Response {
    let app = http_app(state.clone());
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn get(state: &SharedState, path: &str) -> axum::response::Response {
    let app = http_app(state.clone());
    let request = Request::builder().uri(path).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

/// POST an execution and wait for it to reach a terminal state.
async fn run_command(state: &SharedState, command: &str) -> String {
    let response = post_json(
        state,
        "/api/executions",
        serde_json::json!({"command": command}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    state.engine.wait(&id).await.unwrap();
    id
}

// =============================================================================
// Health & envelope
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_envelope() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = get(&state, "/api/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert!(body["data"]["uptime_seconds"].is_number());
    assert!(body["data"]["version"].is_string());
    assert!(body["error"].is_null());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_status_reports_components() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let body = body_json(get(&state, "/api/health/status").await).await;
    assert_eq!(body["data"]["components"]["database"], "healthy");
    assert_eq!(body["data"]["active_executions"], 0);
    assert_eq!(body["data"]["accepting"], true);
}

#[tokio::test]
async fn test_health_optimize_endpoint() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(&state, "/api/health/optimize", serde_json::json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["integrity"], "ok");
}

// =============================================================================
// Execution lifecycle over HTTP
// =============================================================================

#[tokio::test]
async fn test_happy_path_over_http() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let id = run_command(
        &state,
        "sh -c 'echo STEP_START:build; echo hello; echo STEP_COMPLETE:build'",
    )
    .await;

    let response = get(&state, &format!("/api/executions/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = &body["data"];
    assert_eq!(data["status"], "completed");
    assert_eq!(data["exit_code"], 0);
    assert_eq!(data["total_steps"], 1);
    assert_eq!(data["completed_steps"], 1);

    let steps = data["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["name"], "build");
    assert_eq!(steps[0]["status"], "completed");
    let logs = steps[0]["logs"].as_array().unwrap();
    assert!(logs.iter().any(|l| l["content"] == "hello"));
}

#[tokio::test]
async fn test_create_with_unknown_field_is_400() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "true", "unexpected": 1}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_create_with_empty_command_is_400() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "   "}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_with_zero_timeout_is_400() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "true", "timeout": 0}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_working_directory_escape_is_400() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "true", "working_directory": "../../etc"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_execution_is_404() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = get(&state, "/api/executions/no-such-id").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_invalid_status_filter_is_400() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = get(&state, "/api/executions?status=bogus").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_and_filter() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let first = run_command(&state, "sh -c 'echo one'").await;
    let second = run_command(&state, "sh -c 'echo two'").await;

    let body = body_json(get(&state, "/api/executions?limit=10").await).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let returned: Vec<&str> = items.iter().map(|e| e["id"].as_str().unwrap()).collect();
    assert!(returned.contains(&first.as_str()));
    assert!(returned.contains(&second.as_str()));

    let filtered = body_json(get(&state, "/api/executions?status=completed").await).await;
    assert_eq!(filtered["data"].as_array().unwrap().len(), 2);
    let none = body_json(get(&state, "/api/executions?status=failed").await).await;
    assert_eq!(none["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_statistics_endpoint() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    run_command(&state, "sh -c 'echo ok'").await;
    run_command(&state, "sh -c 'exit 1'").await;

    let body = body_json(get(&state, "/api/executions/statistics").await).await;
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["completed"], 1);
    assert_eq!(body["data"]["failed"], 1);
}

#[tokio::test]
async fn test_cancel_running_then_conflict_when_terminal() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "sh -c 'echo STEP_START:loop; sleep 60'"}),
    )
    .await;
    let body = body_json(response).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = post_json(
        &state,
        &format!("/api/executions/{}/cancel", id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    state.engine.wait(&id).await.unwrap();

    let detail = body_json(get(&state, &format!("/api/executions/{}", id)).await).await;
    assert_eq!(detail["data"]["status"], "cancelled");
    let steps = detail["data"]["steps"].as_array().unwrap();
    assert_eq!(steps[0]["status"], "failed");
    assert_eq!(steps[0]["error_message"], "cancelled");

    // Cancel after terminal is a conflict.
    let response = post_json(
        &state,
        &format!("/api/executions/{}/cancel", id),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Cancel of an unknown execution is 404.
    let response = post_json(
        &state,
        "/api/executions/ghost/cancel",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_cascades_and_sweeps_files() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let id = run_command(
        &state,
        "sh -c 'echo STEP_START:s; echo data > out.txt; echo ARTIFACT:out.txt:Output; echo STEP_COMPLETE:s'",
    )
    .await;

    let log_dir = dir.path().join("executions").join(&id);
    let artifact_dir = dir.path().join("artifacts").join(&id);
    assert!(log_dir.exists());
    assert!(artifact_dir.exists());

    let app = http_app(state.clone());
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/executions/{}", id))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Rows are gone as soon as the delete returns.
    let response = get(&state, &format!("/api/executions/{}", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Files disappear after the background sweep.
    for _ in 0..100 {
        if !log_dir.exists() && !artifact_dir.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!log_dir.exists());
    assert!(!artifact_dir.exists());
}

#[tokio::test]
async fn test_active_endpoint_sees_running_execution() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let response = post_json(
        &state,
        "/api/executions",
        serde_json::json!({"command": "sh -c 'sleep 2'"}),
    )
    .await;
    let id = body_json(response).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let body = body_json(get(&state, "/api/executions/active").await).await;
    let active: Vec<String> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap().to_string())
        .collect();
    assert!(active.contains(&id));

    // Deleting a running execution is a conflict.
    let app = http_app(state.clone());
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/executions/{}", id))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    state
        .engine
        .cancel(&id, stepflow::engine::CancelReason::Requested)
        .await
        .unwrap();
    state.engine.wait(&id).await.unwrap();
}

// =============================================================================
// Artifacts over HTTP
// =============================================================================

#[tokio::test]
async fn test_artifact_metadata_and_download() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let id = run_command(
        &state,
        "sh -c 'echo STEP_START:report; printf \"<tests/>\" > report.xml; echo ARTIFACT:report.xml:Unit tests; echo STEP_COMPLETE:report'",
    )
    .await;

    let body = body_json(get(&state, &format!("/api/artifacts/execution/{}", id)).await).await;
    let artifacts = body["data"].as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    let artifact_id = artifacts[0]["id"].as_str().unwrap().to_string();
    assert_eq!(artifacts[0]["mime_type"], "application/xml");
    assert_eq!(artifacts[0]["artifact_type"], "data");

    let body = body_json(get(&state, &format!("/api/artifacts/{}", artifact_id)).await).await;
    assert_eq!(body["data"]["file_name"], "report.xml");
    assert_eq!(body["data"]["description"], "Unit tests");
    assert_eq!(
        body["data"]["download_url"],
        format!("/api/artifacts/{}/download", artifact_id)
    );
    assert_eq!(body["data"]["missing"], false);

    let response = get(&state, &format!("/api/artifacts/{}/download", artifact_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/xml");
    assert!(response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("report.xml"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"<tests/>");
}

#[tokio::test]
async fn test_artifacts_for_unknown_execution_is_404() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let response = get(&state, "/api/artifacts/execution/ghost").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_restart_fails_interrupted_executions_once() {
    let dir = TempDir::new().unwrap();

    // Simulate a crash: write a running execution straight into the store,
    // as if the server died mid-run.
    {
        let state = test_state(&dir).await;
        let mut execution = Execution::new("doomed", "sh -c 'sleep 999'");
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(chrono::Utc::now());
        let mut step = Step::new(&execution.id, 0, "stuck");
        step.status = StepStatus::Running;
        let e = execution.clone();
        state
            .store
            .call(move |store| {
                store.save_execution(&e)?;
                store.save_step(&step)
            })
            .await
            .unwrap();
    }

    // First restart repairs the remnant.
    let state = test_state(&dir).await;
    let body = body_json(get(&state, "/api/executions?limit=10").await).await;
    let items = body["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "failed");
    assert_eq!(
        items[0]["error_message"],
        "server restarted during execution"
    );
    let id = items[0]["id"].as_str().unwrap().to_string();

    let detail = body_json(get(&state, &format!("/api/executions/{}", id)).await).await;
    assert_eq!(detail["data"]["steps"][0]["status"], "failed");

    // New work proceeds normally after recovery.
    let new_id = run_command(&state, "sh -c 'echo fine'").await;
    let detail = body_json(get(&state, &format!("/api/executions/{}", new_id)).await).await;
    assert_eq!(detail["data"]["status"], "completed");

    // A second restart finds nothing to repair.
    drop(state);
    let state = test_state(&dir).await;
    let body = body_json(get(&state, "/api/executions?limit=10").await).await;
    let failed_count = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["error_message"] == "server restarted during execution")
        .count();
    assert_eq!(failed_count, 1);
}

// =============================================================================
// Auth stub
// =============================================================================

#[tokio::test]
async fn test_auth_disabled_by_default() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;
    let response = get(&state, "/api/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_enabled_requires_bearer_token() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        storage_path: dir.path().to_path_buf(),
        auth_enabled: true,
        auth_token: Some("sekrit".to_string()),
        ..Config::default()
    };
    let state = build_state(config).await.unwrap();

    let response = get(&state, "/api/health").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let app = http_app(state.clone());
    let request = Request::builder()
        .uri("/api/health")
        .header(header::AUTHORIZATION, "Bearer sekrit")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let app = http_app(state.clone());
    let request = Request::builder()
        .uri("/api/health")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_concurrent_executions_keep_logs_separate_and_ordered() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir).await;

    let mut ids = Vec::new();
    for n in 0..8 {
        let response = post_json(
            &state,
            "/api/executions",
            serde_json::json!({
                "command": format!(
                    "sh -c 'echo STEP_START:job{n}; for i in $(seq 1 50); do echo {n}-$i; done; echo STEP_COMPLETE:job{n}'"
                ),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        ids.push(
            body_json(response).await["data"]["id"]
                .as_str()
                .unwrap()
                .to_string(),
        );
    }
    for id in &ids {
        state.engine.wait(id).await.unwrap();
    }

    for (n, id) in ids.iter().enumerate() {
        let detail = body_json(get(&state, &format!("/api/executions/{}", id)).await).await;
        assert_eq!(detail["data"]["status"], "completed");
        let steps = detail["data"]["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 1);
        let logs = steps[0]["logs"].as_array().unwrap();
        let payload: Vec<&str> = logs
            .iter()
            .map(|l| l["content"].as_str().unwrap())
            .filter(|c| !c.starts_with("STEP_"))
            .collect();
        assert_eq!(payload.len(), 50, "execution {} lost log lines", n);
        for (i, line) in payload.iter().enumerate() {
            assert_eq!(*line, format!("{}-{}", n, i + 1));
        }
    }
}
