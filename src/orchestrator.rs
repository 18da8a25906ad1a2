//! The run driver: sequences every stage for one source document.
//!
//! ```text
//! Idle ─▶ Converting ─▶ Recognizing ─▶ Enriching ─▶ Scripting ─▶ Synthesizing ─▶ Dispatching ─▶ Completed
//!   └──────────┴─────────────┴────────────┴────────────┴─────────────┴──────────────┴──▶ Stopped
//! ```
//!
//! Cancellation is checked between stages here and between pages/batches
//! inside each stage. Whatever happens, [`run_pipeline`] returns a
//! [`RunOutcome`]; run-level errors become a `failed` outcome, cancellation
//! a `stopped` one.

use crate::avatar::Audio2FaceClient;
use crate::config::PipelineConfig;
use crate::error::NarrateError;
use crate::output::{DispatchState, RunOutcome, RunStats, RunStatus};
use crate::pipeline::convert::{self, DocumentConverter, SubprocessConverter};
use crate::pipeline::dispatch::{self, AvatarSink};
use crate::pipeline::input;
use crate::pipeline::recognize::{self, TesseractRecognizer, TextRecognizer};
use crate::pipeline::script::{self, LlmScripter, NarrationScripter};
use crate::pipeline::synth::{self, GoogleTtsSynthesizer, SpeechSynthesizer};
use crate::pipeline::vision::{self, VisionAnalyzer, VlmAnalyzer};
use crate::state::{RunContext, RunState, Stage};
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Prefix of the per-run sub-directory holding the PDF and page images.
pub const SLIDES_DIR_PREFIX: &str = "slides_";

/// Name of the run manifest written into the output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Every external tool and service a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub converter: Arc<dyn DocumentConverter>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub analyzer: Arc<dyn VisionAnalyzer>,
    pub scripter: Arc<dyn NarrationScripter>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub avatar: Arc<dyn AvatarSink>,
}

/// Which language-model provider and model to use.
#[derive(Debug, Clone, Default)]
pub struct ProviderChoice {
    /// Provider name as understood by `edgequake-llm` (`openai`, `anthropic`, …).
    pub provider: Option<String>,
    /// Model for scripting. Default: `gpt-4.1-nano`.
    pub model: Option<String>,
    /// Model for vision analysis. Default: same as `model`.
    pub vision_model: Option<String>,
}

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

impl Collaborators {
    /// The production set: LibreOffice + ImageMagick, Tesseract, an
    /// `edgequake-llm` provider for vision and scripting, Google TTS and
    /// Audio2Face, all configured from the environment.
    pub fn from_env(config: &PipelineConfig, choice: &ProviderChoice) -> Result<Self, NarrateError> {
        let script_provider = resolve_provider(choice, choice.model.as_deref())?;
        let vision_provider = match choice.vision_model.as_deref() {
            Some(model) => resolve_provider(choice, Some(model))?,
            None => Arc::clone(&script_provider),
        };
        Ok(Self {
            converter: Arc::new(SubprocessConverter::default()),
            recognizer: Arc::new(TesseractRecognizer::default()),
            analyzer: Arc::new(VlmAnalyzer::new(vision_provider, config)),
            scripter: Arc::new(LlmScripter::new(script_provider, config)),
            synthesizer: Arc::new(GoogleTtsSynthesizer::from_env()?),
            avatar: Arc::new(Audio2FaceClient::from_env()?),
        })
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, NarrateError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        NarrateError::CollaboratorNotConfigured {
            name: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the language-model provider, from most to least specific:
///
/// 1. an explicitly named provider (`choice.provider`);
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set;
/// 3. OpenAI, when `OPENAI_API_KEY` is set;
/// 4. whatever `ProviderFactory::from_env` detects.
pub fn resolve_provider(
    choice: &ProviderChoice,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, NarrateError> {
    if let Some(ref name) = choice.provider {
        return create_provider(name, model.unwrap_or(DEFAULT_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(DEFAULT_MODEL));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| NarrateError::CollaboratorNotConfigured {
            name: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

/// Claim `state` and run one document.
///
/// Fails only with [`NarrateError::AlreadyProcessing`]; everything after the
/// claim is reported through the returned outcome.
pub async fn narrate(
    source: &Path,
    output_dir: &Path,
    state: &Arc<RunState>,
    collaborators: &Collaborators,
    config: &PipelineConfig,
) -> Result<RunOutcome, NarrateError> {
    let ctx = RunContext::begin(state, config)?;
    Ok(run_pipeline(source, output_dir, &ctx, collaborators, config).await)
}

/// Run every stage for `source`, writing artifacts under `output_dir`.
pub async fn run_pipeline(
    source: &Path,
    output_dir: &Path,
    ctx: &RunContext,
    collaborators: &Collaborators,
    config: &PipelineConfig,
) -> RunOutcome {
    let start = Instant::now();
    let run_id = ctx.run_id().to_string();
    info!("Run {}: starting for {}", run_id, source.display());
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(&source.display().to_string());
    }

    let mut outcome = RunOutcome {
        status: RunStatus::Failed,
        message: String::new(),
        run_id,
        source: source.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        pdf_path: None,
        image_dir: None,
        pages: Vec::new(),
        batches: Vec::new(),
        dispatches: Vec::new(),
        error: None,
        stats: RunStats::default(),
    };

    let (status, stage) = match drive(&mut outcome, ctx, collaborators, config).await {
        Ok(RunStatus::Completed) => {
            outcome.message = "Presentation audio generated and dispatched".to_string();
            (RunStatus::Completed, Stage::Completed)
        }
        Ok(_) => {
            outcome.message = "Processing stopped".to_string();
            (RunStatus::Stopped, Stage::Stopped)
        }
        Err(e) => {
            error!("Run {} failed: {}", outcome.run_id, e);
            outcome.message = "Processing failed".to_string();
            outcome.error = Some(e.to_string());
            (RunStatus::Failed, Stage::Failed)
        }
    };
    outcome.status = status;
    ctx.set_stage(stage);

    let delivered = outcome
        .dispatches
        .iter()
        .filter(|d| d.state == DispatchState::Delivered)
        .count();
    outcome.stats = RunStats::from_records(&outcome.pages, &outcome.batches, delivered);
    outcome.stats.total_duration_ms = start.elapsed().as_millis() as u64;

    info!(
        "Run {}: {:?} after {}ms ({} pages, {} narrated, {} synthesised, {} delivered)",
        outcome.run_id,
        outcome.status,
        outcome.stats.total_duration_ms,
        outcome.stats.total_pages,
        outcome.stats.narrated_pages,
        outcome.stats.synthesized_pages,
        outcome.stats.dispatched_pages
    );

    if config.write_manifest {
        if let Err(e) = write_manifest(&outcome, output_dir).await {
            warn!("Could not write run manifest: {}", e);
        }
    }
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(outcome.status);
    }
    outcome
}

/// Page-image directory of one run: `<output_dir>/slides_<run id>`.
///
/// Each run gets its own, so a reused output directory never feeds an
/// earlier deck's page images into a later run.
pub fn slides_dir(output_dir: &Path, run_id: Uuid) -> PathBuf {
    output_dir.join(format!("{SLIDES_DIR_PREFIX}{run_id}"))
}

fn enter(ctx: &RunContext, config: &PipelineConfig, stage: Stage, units: usize) -> bool {
    if !ctx.should_continue() {
        info!("Run stopped before {:?}", stage);
        return false;
    }
    ctx.set_stage(stage);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(stage, units);
    }
    true
}

async fn drive(
    outcome: &mut RunOutcome,
    ctx: &RunContext,
    c: &Collaborators,
    config: &PipelineConfig,
) -> Result<RunStatus, NarrateError> {
    let source = input::validate_source(&outcome.source, config)?;
    let output_dir = outcome.output_dir.clone();
    let slides_dir = slides_dir(&output_dir, ctx.run_id());
    tokio::fs::create_dir_all(&slides_dir)
        .await
        .map_err(|e| NarrateError::io(&slides_dir, e))?;

    // ── Conversion ───────────────────────────────────────────────────────
    if !enter(ctx, config, Stage::Converting, 0) {
        return Ok(RunStatus::Stopped);
    }
    let pdf = convert::convert_to_pdf(ctx, c.converter.as_ref(), &source, &slides_dir, config).await?;
    outcome.pdf_path = Some(pdf.clone());
    if !ctx.should_continue() {
        return Ok(RunStatus::Stopped);
    }
    let images =
        convert::convert_pdf_to_images(c.converter.as_ref(), &pdf, &slides_dir, config).await?;
    outcome.image_dir = Some(slides_dir.clone());

    // ── Recognition ──────────────────────────────────────────────────────
    if !enter(ctx, config, Stage::Recognizing, images.len()) {
        return Ok(RunStatus::Stopped);
    }
    outcome.pages =
        recognize::recognize_pages(ctx, &images, Arc::clone(&c.recognizer), config).await;

    // ── Enrichment ───────────────────────────────────────────────────────
    if !enter(ctx, config, Stage::Enriching, outcome.pages.len()) {
        return Ok(RunStatus::Stopped);
    }
    vision::enrich_pages(ctx, &mut outcome.pages, c.analyzer.as_ref(), &slides_dir, config).await;

    // ── Scripting ────────────────────────────────────────────────────────
    let batch_count = script::partition_batches(outcome.pages.len(), config.batch_size).len();
    if !enter(ctx, config, Stage::Scripting, batch_count) {
        return Ok(RunStatus::Stopped);
    }
    outcome.batches =
        script::script_batches(ctx, &mut outcome.pages, c.scripter.as_ref(), config).await;

    // ── Synthesis ────────────────────────────────────────────────────────
    let narrated = outcome.pages.iter().filter(|p| p.narration.is_some()).count();
    if !enter(ctx, config, Stage::Synthesizing, narrated) {
        return Ok(RunStatus::Stopped);
    }
    let source_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    synth::synthesize_pages(
        ctx,
        &mut outcome.pages,
        c.synthesizer.as_ref(),
        &source_name,
        &output_dir,
        config,
    )
    .await;

    // ── Dispatch ─────────────────────────────────────────────────────────
    let synthesized = outcome.pages.iter().filter(|p| p.audio_path.is_some()).count();
    if !enter(ctx, config, Stage::Dispatching, synthesized) {
        return Ok(RunStatus::Stopped);
    }
    let pending = dispatch::dispatch_pages(ctx, &outcome.pages, Arc::clone(&c.avatar), config).await;
    let stopped = !ctx.should_continue();
    outcome.dispatches =
        dispatch::finish_dispatches(ctx, pending, config.await_dispatches && !stopped, config).await;
    for report in &outcome.dispatches {
        if let DispatchState::Failed { ref error } = report.state {
            if let Some(page) = outcome.pages.iter_mut().find(|p| p.page_num == report.page_num) {
                page.errors.push(error.clone());
            }
        }
    }
    if stopped || !ctx.should_continue() {
        return Ok(RunStatus::Stopped);
    }

    ctx.set_current_slide(outcome.pages.len());
    Ok(RunStatus::Completed)
}

/// Write `manifest.json` atomically (temp file + rename).
pub async fn write_manifest(outcome: &RunOutcome, output_dir: &Path) -> Result<PathBuf, NarrateError> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| NarrateError::io(output_dir, e))?;
    let path = output_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(outcome)
        .map_err(|e| NarrateError::Internal(format!("manifest serialisation: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| NarrateError::io(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|e| NarrateError::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manifest_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run");
        let outcome = RunOutcome {
            status: RunStatus::Stopped,
            message: "Processing stopped".into(),
            run_id: "r1".into(),
            source: PathBuf::from("deck.pptx"),
            output_dir: out.clone(),
            pdf_path: None,
            image_dir: None,
            pages: vec![],
            batches: vec![],
            dispatches: vec![],
            error: None,
            stats: RunStats::default(),
        };
        let path = write_manifest(&outcome, &out).await.unwrap();
        assert!(path.ends_with(MANIFEST_FILE));
        assert!(!out.join("manifest.json.tmp").exists());
        let back: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back["status"], "stopped");
        assert_eq!(back["run_id"], "r1");
    }
}
