//! HTTP trigger surface.
//!
//! | Route          | Effect                                                     |
//! |----------------|------------------------------------------------------------|
//! | `POST /upload` | multipart `presentation` (+ optional `output_dir`); runs the pipeline and returns the [`RunOutcome`] |
//! | `POST /stop`   | cancel the active run, then run the avatar recovery command |
//! | `GET /status`  | [`RunSnapshot`] of the shared run state                     |
//!
//! A second upload while a run is active gets `409 Conflict`. The run itself
//! executes on its own task, so a client that disconnects mid-request does
//! not abort it; only `/stop` does.

use crate::config::PipelineConfig;
use crate::error::NarrateError;
use crate::orchestrator::{run_pipeline, Collaborators};
use crate::output::{RunOutcome, RunStatus};
use crate::pipeline::input::sanitize_filename;
use crate::state::{RunContext, RunSnapshot, RunState};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Settings for the HTTP surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where uploaded documents are saved. Default: `uploads`.
    pub upload_dir: PathBuf,
    /// Root under which each run gets its own output directory. Default: `outputs`.
    pub output_root: PathBuf,
    /// Request body limit in bytes. Default: 16 MiB.
    pub max_upload_bytes: usize,
    /// Program + args run after `/stop` to recover the avatar service.
    pub recovery_command: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_root: PathBuf::from("outputs"),
            max_upload_bytes: 16 * 1024 * 1024,
            recovery_command: None,
        }
    }
}

struct ServerState {
    run_state: Arc<RunState>,
    collaborators: Collaborators,
    pipeline: PipelineConfig,
    server: ServerConfig,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ServerState>,
}

impl AppState {
    pub fn new(
        run_state: Arc<RunState>,
        collaborators: Collaborators,
        pipeline: PipelineConfig,
        server: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServerState {
                run_state,
                collaborators,
                pipeline,
                server,
            }),
        }
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.inner.run_state
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StopBody {
    message: &'static str,
    was_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<String>,
}

fn reject(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let limit = state.inner.server.max_upload_bytes;
    Router::new()
        .route("/upload", post(upload))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), NarrateError> {
    for dir in [&state.inner.server.upload_dir, &state.inner.server.output_root] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| NarrateError::io(dir, e))?;
    }
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| NarrateError::Internal(format!("Failed to bind {addr}: {e}")))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| NarrateError::Internal(format!("Server error: {e}")))?;
    info!("Server on {} stopped", addr);
    Ok(())
}

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
    output_dir: Option<String>,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Option<Upload>, MultipartError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut output_dir = None;
    while let Some(field) = multipart.next_field().await? {
        match field.name().unwrap_or("") {
            "presentation" => {
                let name = field.file_name().unwrap_or("").to_string();
                let bytes = field.bytes().await?;
                file = Some((name, bytes.to_vec()));
            }
            "output_dir" => {
                let text = field.text().await?;
                if !text.trim().is_empty() {
                    output_dir = Some(text.trim().to_string());
                }
            }
            _ => {}
        }
    }
    Ok(file.map(|(file_name, bytes)| Upload {
        file_name,
        bytes,
        output_dir,
    }))
}

async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let s = &state.inner;
    let upload = match read_upload(&mut multipart).await {
        Ok(Some(u)) if !u.bytes.is_empty() => u,
        Ok(_) => return reject(StatusCode::BAD_REQUEST, "invalid file or no file uploaded."),
        Err(e) => return reject(e.status(), e.body_text()),
    };

    let Some(file_name) = sanitize_filename(&upload.file_name) else {
        return reject(StatusCode::BAD_REQUEST, "invalid file or no file uploaded.");
    };
    let ext = Path::new(&file_name)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !s.pipeline.accepts_extension(&ext) {
        return reject(
            StatusCode::BAD_REQUEST,
            format!("unsupported file type; expected one of {:?}", s.pipeline.allowed_extensions),
        );
    }

    let ctx = match RunContext::begin(&s.run_state, &s.pipeline) {
        Ok(ctx) => ctx,
        Err(e @ NarrateError::AlreadyProcessing) => {
            return reject(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => return reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let run_dir = match upload.output_dir.as_deref() {
        Some(requested) => match sanitize_filename(requested) {
            Some(dir) => dir,
            None => return reject(StatusCode::BAD_REQUEST, "invalid output_dir"),
        },
        None => ctx.run_id().to_string(),
    };
    let output_dir = s.server.output_root.join(run_dir);

    if let Err(e) = tokio::fs::create_dir_all(&s.server.upload_dir).await {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let source = s.server.upload_dir.join(&file_name);
    if let Err(e) = tokio::fs::write(&source, &upload.bytes).await {
        error!("Failed to save upload {}: {}", source.display(), e);
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "failed to save upload");
    }
    info!(
        "Accepted upload {} ({} bytes) as run {}",
        file_name,
        upload.bytes.len(),
        ctx.run_id()
    );

    let task_state = Arc::clone(&state.inner);
    let run = tokio::spawn(async move {
        run_pipeline(
            &source,
            &output_dir,
            &ctx,
            &task_state.collaborators,
            &task_state.pipeline,
        )
        .await
    });

    match run.await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => {
            error!("Run task ended abnormally: {}", e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, "run task panicked")
        }
    }
}

fn outcome_response(outcome: RunOutcome) -> Response {
    let status = match outcome.status {
        RunStatus::Completed | RunStatus::Stopped => StatusCode::OK,
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome)).into_response()
}

async fn stop(State(state): State<AppState>) -> Json<StopBody> {
    let was_processing = state.inner.run_state.cancel();
    let recovery = match state.inner.server.recovery_command.as_deref() {
        Some([program, args @ ..]) => Some(run_recovery(program, args).await),
        _ => None,
    };
    Json(StopBody {
        message: if was_processing {
            "processing stopped."
        } else {
            "no presentation is being processed."
        },
        was_processing,
        recovery,
    })
}

async fn run_recovery(program: &str, args: &[String]) -> String {
    info!("Running avatar recovery command: {} {:?}", program, args);
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => "ok".to_string(),
        Ok(out) => {
            let msg = format!(
                "{} exited with {}: {}",
                program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            warn!("{}", msg);
            msg
        }
        Err(e) => {
            warn!("Recovery command {} failed to start: {}", program, e);
            format!("{program} failed to start: {e}")
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<RunSnapshot> {
    Json(state.inner.run_state.snapshot())
}
