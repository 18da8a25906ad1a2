//! Recognition stage: page images → page text, on a bounded worker pool.
//!
//! Recognition is CPU-bound and synchronous, so each task runs on tokio's
//! blocking pool via `spawn_blocking`, with at most
//! [`PipelineConfig::recognition_workers`] in flight at once
//! (`buffer_unordered`). Every task gets its own timeout; a page that fails
//! or times out keeps empty text and carries a [`PageError`], and the stage
//! itself never fails.
//!
//! A timed-out task cannot be killed: its blocking thread runs to completion
//! in the background and the result is discarded. The worker slot travels
//! with that thread as a semaphore permit, so abandoned work still counts
//! against the pool until it actually ends.

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, PageError};
use crate::output::PageRecord;
use crate::pipeline::convert::PageImage;
use crate::progress::ProgressCallback;
use crate::state::{RunContext, Stage};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Synchronous text recognizer.
pub trait TextRecognizer: Send + Sync {
    /// Extract the text of one page image.
    fn recognize(&self, image: &Path) -> Result<String, CollaboratorError>;
}

/// Tesseract via its command-line interface: `tesseract <image> stdout -l <lang>`.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    pub program: String,
    pub lang: String,
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self {
            program: "tesseract".to_string(),
            lang: "eng".to_string(),
        }
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &Path) -> Result<String, CollaboratorError> {
        let output = Command::new(&self.program)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .output()?;
        if !output.status.success() {
            return Err(CollaboratorError::ProcessFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Recognise every page concurrently and return records ordered by page.
///
/// Pages whose task never started because the run was cancelled come back
/// with empty text and no error; the orchestrator notices the cancellation
/// right after this stage.
pub async fn recognize_pages(
    ctx: &RunContext,
    images: &[PageImage],
    recognizer: Arc<dyn TextRecognizer>,
    config: &PipelineConfig,
) -> Vec<PageRecord> {
    let total = images.len();
    let workers = config.recognition_workers.max(1);
    let timeout = config.recognition_timeout();
    let callback: Option<ProgressCallback> = config.progress_callback.clone();
    info!(
        "Recognising {} pages with {} workers ({}s timeout each)",
        total,
        workers,
        config.recognition_timeout_secs
    );

    let slots = Arc::new(Semaphore::new(workers));

    let mut records: Vec<PageRecord> = stream::iter(images.iter().cloned().map(|image| {
        let recognizer = Arc::clone(&recognizer);
        let callback = callback.clone();
        let slots = Arc::clone(&slots);
        async move {
            let mut record = PageRecord::new(image.page_num, image.path.clone(), String::new());
            let permit = match slots.acquire_owned().await {
                Ok(permit) if ctx.should_continue() => permit,
                _ => {
                    debug!("Page {}: recognition skipped, run stopped", image.page_num);
                    return record;
                }
            };

            let path = image.path.clone();
            let task = tokio::task::spawn_blocking(move || {
                let _slot = permit;
                recognizer.recognize(&path)
            });
            let error = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(text))) => {
                    record.text = text;
                    None
                }
                Ok(Ok(Err(e))) => Some(PageError::RecognitionFailed {
                    page: image.page_num,
                    detail: e.to_string(),
                }),
                Ok(Err(join)) => Some(PageError::RecognitionFailed {
                    page: image.page_num,
                    detail: format!("recognition task panicked: {join}"),
                }),
                Err(_) => Some(PageError::RecognitionTimeout {
                    page: image.page_num,
                    secs: timeout.as_secs(),
                }),
            };

            if let Some(err) = error {
                warn!("{}", err);
                if let Some(ref cb) = callback {
                    cb.on_page_error(image.page_num, Stage::Recognizing, &err.to_string());
                }
                record.errors.push(err);
            } else {
                debug!(
                    "Page {}: recognised {} chars",
                    image.page_num,
                    record.text.len()
                );
            }
            if let Some(ref cb) = callback {
                cb.on_page_recognized(image.page_num, total, record.text.len());
            }
            record
        }
    }))
    .buffer_unordered(workers)
    .collect()
    .await;

    records.sort_by_key(|r| r.page_num);
    records
}
