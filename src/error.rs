//! Error types for the slidecast pipeline.
//!
//! Failures are split by how much of a run they take down:
//!
//! * [`NarrateError`]. **Fatal to the run**: nothing downstream is possible
//!   (source rejected, PDF never appeared, rasteriser failed, no page images).
//!   The orchestrator turns it into a `failed` [`crate::output::RunOutcome`].
//!
//! * [`PageError`]. **Fatal to one page**: recognition, synthesis or dispatch
//!   failed for that page, or vision enrichment was unavailable. Stored on the
//!   [`crate::output::PageRecord`]; the run continues.
//!
//! * [`BatchError`]. **Fatal to one batch**: the scripting response for that
//!   batch was malformed, carried an error, or did not match the batch's pages.
//!   Stored on the [`crate::output::BatchReport`]; later batches still run.
//!
//! * [`CollaboratorError`]: what every external tool or service adapter
//!   returns. The pipeline maps it onto one of the three categories above.

use std::path::PathBuf;
use thiserror::Error;

/// All run-level errors.
///
/// Page- and batch-level failures use [`PageError`] and [`BatchError`] and are
/// recorded on the outcome instead of propagated here.
#[derive(Debug, Error)]
pub enum NarrateError {
    // ── Trigger errors ────────────────────────────────────────────────────
    /// Another run holds the processing guard.
    #[error("A presentation is already being processed; stop it first or wait for it to finish")]
    AlreadyProcessing,

    // ── Input errors ──────────────────────────────────────────────────────
    /// Source document was not found at the given path.
    #[error("Source document not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// Process does not have read permission on the source document.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The source document's extension is not in the allowed set.
    #[error("Unsupported document '{path}': expected one of {allowed:?}")]
    UnsupportedDocument { path: PathBuf, allowed: Vec<String> },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// The converter never produced the expected PDF within the wait window.
    #[error("PDF '{path}' was not created within {waited_secs}s")]
    PdfNotCreated { path: PathBuf, waited_secs: u64 },

    /// The rasteriser exited unsuccessfully.
    #[error("Rasterising '{pdf}' failed: {detail}")]
    RasterisationFailed { pdf: PathBuf, detail: String },

    /// Rasterisation reported success but no `slide_<n>` images exist.
    #[error("No page images found in '{dir}'")]
    NoPageImages { dir: PathBuf },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// A collaborator could not be constructed (missing key, bad endpoint).
    #[error("Collaborator '{name}' is not configured.\n{hint}")]
    CollaboratorNotConfigured { name: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a run directory or artifact.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NarrateError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NarrateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// The recognizer failed on this page's image.
    #[error("Page {page}: recognition failed: {detail}")]
    RecognitionFailed { page: usize, detail: String },

    /// The recognizer did not finish within the per-task timeout.
    #[error("Page {page}: recognition timed out after {secs}s")]
    RecognitionTimeout { page: usize, secs: u64 },

    /// The page image never materialised.
    #[error("Page {page}: image '{path}' not found")]
    ImageMissing { page: usize, path: PathBuf },

    /// The vision analyzer failed; the page keeps its recognition text.
    #[error("Page {page}: vision analysis unavailable: {detail}")]
    AnalysisUnavailable { page: usize, detail: String },

    /// Speech synthesis failed or its audio could not be written.
    #[error("Page {page}: synthesis failed: {detail}")]
    SynthesisFailed { page: usize, detail: String },

    /// The avatar service rejected or never received the audio.
    #[error("Page {page}: dispatch failed: {detail}")]
    DispatchFailed { page: usize, detail: String },
}

impl PageError {
    /// The 1-based page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RecognitionFailed { page, .. }
            | PageError::RecognitionTimeout { page, .. }
            | PageError::ImageMissing { page, .. }
            | PageError::AnalysisUnavailable { page, .. }
            | PageError::SynthesisFailed { page, .. }
            | PageError::DispatchFailed { page, .. } => *page,
        }
    }
}

/// A non-fatal error for one scripting batch.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchError {
    /// The scripting service could not be reached after retries.
    #[error("Batch {batch}: scripting call failed after {retries} retries: {detail}")]
    CallFailed {
        batch: usize,
        retries: u32,
        detail: String,
    },

    /// The response was not the expected JSON shape.
    #[error("Batch {batch}: malformed scripting response: {detail}")]
    MalformedResponse { batch: usize, detail: String },

    /// The response carried an `error` field.
    #[error("Batch {batch}: scripting service returned an error: {message}")]
    ServiceError { batch: usize, message: String },

    /// Response page numbers do not correspond 1:1 to the batch's pages.
    #[error("Batch {batch}: expected pages {expected:?}, got {got:?}")]
    PageMismatch {
        batch: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Errors surfaced by collaborator adapters (subprocesses and services).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Spawning a process or touching a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A subprocess exited unsuccessfully.
    #[error("'{program}' exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// An HTTP transport or status error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An RPC call failed or the remote end reported failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The service answered with something we could not interpret.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The collaborator is switched off or unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        CollaboratorError::Http(e.to_string())
    }
}
