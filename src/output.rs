//! Records produced by a run.
//!
//! Each stage fills in one more optional field of [`PageRecord`]; nothing is
//! ever removed from a page mid-run. Payloads from external services are
//! parsed into these typed records at the boundary, so a malformed response
//! fails there instead of leaking loosely-typed maps downstream.

use crate::error::{BatchError, PageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-based page number, assigned once during image enumeration.
    pub page_num: usize,

    /// Rasterised page image (`slide_<page_num - 1>.<ext>`).
    pub image_path: PathBuf,

    /// Recognition text, possibly replaced by the vision analyzer's text.
    pub text: String,

    /// Vision payload without its text field. `Some(default)` means
    /// enrichment ran but found nothing; `None` means it never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ImageAnalysis>,

    /// Narration produced by the scripting step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,

    /// Synthesised audio artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,

    /// Every degradation this page went through, in stage order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PageError>,
}

impl PageRecord {
    pub fn new(page_num: usize, image_path: PathBuf, text: String) -> Self {
        Self {
            page_num,
            image_path,
            text,
            analysis: None,
            narration: None,
            audio_path: None,
            errors: Vec::new(),
        }
    }
}

/// Vision analysis of one page image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    /// One-line caption of the slide.
    #[serde(default)]
    pub description: String,

    /// Labels of everything detected.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Detected objects with confidence and bounding box.
    #[serde(default)]
    pub objects: Vec<DetectedObject>,

    /// Layout regions (title, text, figure, table…).
    #[serde(default)]
    pub layout: Vec<LayoutRegion>,

    /// Analyzer's own text extraction. Promoted to [`PageRecord::text`] during
    /// enrichment and never stored on the merged payload.
    #[serde(default, alias = "ocr_text", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ImageAnalysis {
    /// Whether nothing was detected.
    pub fn is_empty(&self) -> bool {
        self.description.is_empty()
            && self.tags.is_empty()
            && self.objects.is_empty()
            && self.layout.is_empty()
            && self.text.is_none()
    }
}

/// A detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub name: String,
    #[serde(default)]
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in image pixels.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
}

/// A layout region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRegion {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    #[serde(default)]
    pub text: String,
}

/// Result of one scripting batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// 0-based batch index.
    pub batch: usize,
    /// Page numbers in this batch, ascending.
    pub pages: Vec<usize>,
    /// Set when the whole batch contributed no narration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

/// Result of one avatar push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub page_num: usize,
    pub audio_path: PathBuf,
    #[serde(flatten)]
    pub state: DispatchState,
}

/// What became of a background avatar push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    /// The avatar accepted the audio.
    Delivered,
    /// The push failed.
    Failed { error: PageError },
    /// The run stopped (or did not wait) before the push finished.
    Abandoned,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Stopped,
    Failed,
}

/// The structured outcome every run returns, whatever happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: String,
    pub run_id: String,
    pub source: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,
    pub pages: Vec<PageRecord>,
    pub batches: Vec<BatchReport>,
    pub dispatches: Vec<DispatchReport>,
    /// Run-level error text when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: RunStats,
}

impl RunOutcome {
    /// Audio artifacts in page order.
    pub fn audio_paths(&self) -> Vec<PathBuf> {
        self.pages
            .iter()
            .filter_map(|p| p.audio_path.clone())
            .collect()
    }
}

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub recognized_pages: usize,
    pub enriched_pages: usize,
    pub narrated_pages: usize,
    pub synthesized_pages: usize,
    pub dispatched_pages: usize,
    pub failed_batches: usize,
    pub total_duration_ms: u64,
}

impl RunStats {
    pub fn from_records(pages: &[PageRecord], batches: &[BatchReport], dispatched: usize) -> Self {
        Self {
            total_pages: pages.len(),
            recognized_pages: pages
                .iter()
                .filter(|p| {
                    !p.errors.iter().any(|e| {
                        matches!(
                            e,
                            PageError::RecognitionFailed { .. } | PageError::RecognitionTimeout { .. }
                        )
                    })
                })
                .count(),
            enriched_pages: pages
                .iter()
                .filter(|p| p.analysis.as_ref().is_some_and(|a| !a.is_empty()))
                .count(),
            narrated_pages: pages.iter().filter(|p| p.narration.is_some()).count(),
            synthesized_pages: pages.iter().filter(|p| p.audio_path.is_some()).count(),
            dispatched_pages: dispatched,
            failed_batches: batches.iter().filter(|b| b.error.is_some()).count(),
            total_duration_ms: 0,
        }
    }
}
