//! Progress-callback trait for per-stage and per-page run events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator advances.
//!
//! # Example
//!
//! ```rust
//! use slidecast::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct DispatchCounter {
//!     dispatched: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for DispatchCounter {
//!     fn on_page_dispatched(&self, page_num: usize, total_pages: usize) {
//!         let n = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("Slide {page_num}/{total_pages} sent to the avatar ({n} so far)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(DispatchCounter { dispatched: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::RunStatus;
use crate::state::Stage;
use std::sync::Arc;

/// Called by the orchestrator as a run advances.
///
/// Implementations must be `Send + Sync`: recognition events fire from the
/// worker pool's completion path, concurrently with each other. All methods
/// default to no-ops so callers only override what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once the source has been accepted and the run starts.
    fn on_run_start(&self, source: &str) {
        let _ = source;
    }

    /// Called when the orchestrator enters a stage.
    ///
    /// # Arguments
    /// * `stage`: the stage being entered
    /// * `units`: pages (or batches, for scripting) the stage will handle;
    ///   0 when not yet known
    fn on_stage_start(&self, stage: Stage, units: usize) {
        let _ = (stage, units);
    }

    /// Called when a page's recognition task finishes, successfully or not.
    fn on_page_recognized(&self, page_num: usize, total_pages: usize, text_len: usize) {
        let _ = (page_num, total_pages, text_len);
    }

    /// Called after a page's vision enrichment, including soft failures.
    fn on_page_enriched(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called after each scripting batch.
    ///
    /// # Arguments
    /// * `batch`: 0-based batch index
    /// * `total`: number of batches
    /// * `narrated`: pages in this batch that received narration
    fn on_batch_scripted(&self, batch: usize, total: usize, narrated: usize) {
        let _ = (batch, total, narrated);
    }

    /// Called after a page's audio artifact is written.
    fn on_page_synthesized(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called right after a page's audio has been handed to the avatar,
    /// before the pacing delay.
    fn on_page_dispatched(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page degrades at any stage.
    fn on_page_error(&self, page_num: usize, stage: Stage, error: &str) {
        let _ = (page_num, stage, error);
    }

    /// Called once with the final status.
    fn on_run_complete(&self, status: RunStatus) {
        let _ = status;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
