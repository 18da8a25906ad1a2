//! # slidecast
//!
//! Turn a slide deck into narrated audio and push it, slide by slide, to a
//! talking avatar.
//!
//! ## Pipeline Overview
//!
//! ```text
//! deck.pptx
//!  │
//!  ├─ 1. Convert     LibreOffice → PDF, ImageMagick → slide_N.png
//!  ├─ 2. Recognize   Tesseract on a bounded worker pool (spawn_blocking)
//!  ├─ 3. Enrich      vision model describes each slide; its text wins
//!  ├─ 4. Script      language model writes presenter narration, 5 slides per call
//!  ├─ 5. Synthesize  Google TTS → <deck>-slide_audioN.wav
//!  └─ 6. Dispatch    Audio2Face gRPC, one slide every few seconds
//! ```
//!
//! Per-page failures degrade the page and the run carries on; only
//! conversion failures end a run early. A shared [`RunState`] lets another
//! task (the `/stop` route, Ctrl-C) stop the run between steps.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slidecast::{narrate, Collaborators, PipelineConfig, ProviderChoice, RunState};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let collaborators = Collaborators::from_env(&config, &ProviderChoice::default())?;
//!     let state = RunState::new();
//!     let outcome = narrate(
//!         Path::new("deck.pptx"),
//!         Path::new("outputs/deck"),
//!         &state,
//!         &collaborators,
//!         &config,
//!     )
//!     .await?;
//!     eprintln!("{:?}: {} audio files", outcome.status, outcome.audio_paths().len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | `POST /upload`, `POST /stop`, `GET /status` (axum) |
//! | `cli`    | on      | The `slidecast` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod avatar;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
#[cfg(feature = "server")]
pub mod server;
pub mod state;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{BatchError, CollaboratorError, NarrateError, PageError};
pub use orchestrator::{narrate, resolve_provider, run_pipeline, Collaborators, ProviderChoice};
pub use output::{
    BatchReport, DispatchReport, DispatchState, ImageAnalysis, PageRecord, RunOutcome, RunStats,
    RunStatus,
};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use state::{RunContext, RunSnapshot, RunState, Stage};
