//! HTTP surface tests: the router is driven in-process with `oneshot`.

#![cfg(feature = "server")]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{fakes, fast_config};
use slidecast::server::{router, AppState, ServerConfig};
use slidecast::RunState;
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "slidecast-test-boundary";

struct Harness {
    app: Router,
    state: Arc<RunState>,
    _dir: tempfile::TempDir,
    upload_dir: std::path::PathBuf,
    output_root: std::path::PathBuf,
}

fn harness(recovery_command: Option<Vec<String>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().join("uploads");
    let output_root = dir.path().join("outputs");
    let state = RunState::new();
    let app_state = AppState::new(
        Arc::clone(&state),
        fakes(2).collaborators,
        fast_config().build().unwrap(),
        ServerConfig {
            upload_dir: upload_dir.clone(),
            output_root: output_root.clone(),
            recovery_command,
            ..Default::default()
        },
    );
    Harness {
        app: router(app_state),
        state,
        _dir: dir,
        upload_dir,
        output_root,
    }
}

/// A multipart body with an optional `presentation` file and `output_dir` field.
fn multipart(file: Option<(&str, &[u8])>, output_dir: Option<&str>) -> Request<Body> {
    let mut body: Vec<u8> = Vec::new();
    if let Some((name, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"presentation\"; \
                 filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    if let Some(dir) = output_dir {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"output_dir\"\r\n\r\n{dir}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_an_idle_pipeline() {
    let h = harness(None);
    let resp = h
        .app
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["is_processing"], false);
    assert_eq!(body["current_slide"], 0);
    assert_eq!(body["stage"], "idle");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_runs_the_pipeline_to_completion() {
    let h = harness(None);
    let resp = h
        .app
        .oneshot(multipart(Some(("Team Update.pptx", b"PK fake deck")), Some("talk")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["pages"].as_array().unwrap().len(), 2);
    assert_eq!(body["dispatches"].as_array().unwrap().len(), 2);

    assert!(h.upload_dir.join("Team_Update.pptx").exists());
    let run_dir = h.output_root.join("talk");
    assert!(Path::new(body["output_dir"].as_str().unwrap()).ends_with("talk"));
    assert!(run_dir.join("Team_Updat-slide_audio1.wav").exists());
    assert!(!h.state.is_processing());
}

#[tokio::test]
async fn upload_while_busy_is_rejected() {
    let h = harness(None);
    let _held = h.state.try_begin().unwrap();
    let resp = h
        .app
        .oneshot(multipart(Some(("deck.pptx", b"PK fake deck")), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("already being processed"));
}

#[tokio::test]
async fn upload_without_a_file_is_rejected() {
    let h = harness(None);
    let resp = h.app.oneshot(multipart(None, Some("talk"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "invalid file or no file uploaded.");
}

#[tokio::test]
async fn upload_with_wrong_extension_is_rejected() {
    let h = harness(None);
    let resp = h
        .app
        .oneshot(multipart(Some(("slides.pdf", b"%PDF-1.4")), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!h.upload_dir.join("slides.pdf").exists());
    assert!(!h.state.is_processing());
}

#[tokio::test]
async fn stop_when_idle_reports_nothing_to_stop() {
    let h = harness(None);
    let resp = h
        .app
        .oneshot(Request::post("/stop").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["was_processing"], false);
    assert_eq!(body["message"], "no presentation is being processed.");
    assert!(body.get("recovery").is_none());
}

#[tokio::test]
async fn stop_cancels_the_active_run_and_runs_recovery() {
    let h = harness(Some(vec!["true".to_string()]));
    let guard = h.state.try_begin().unwrap();
    let resp = h
        .app
        .oneshot(Request::post("/stop").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["was_processing"], true);
    assert_eq!(body["message"], "processing stopped.");
    assert_eq!(body["recovery"], "ok");

    assert!(!h.state.is_processing());
    assert!(!h.state.snapshot().should_continue);
    // The stopped run's guard no longer matters to the next run.
    drop(guard);
    assert!(h.state.try_begin().is_ok());
}
