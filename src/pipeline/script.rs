//! Batch scripting stage: page text + analysis → narration, a batch at a time.
//!
//! Pages are partitioned into fixed-size batches (ceiling division). Each
//! batch is one call to the [`NarrationScripter`]; the raw reply is parsed and
//! validated here, at the boundary. A batch fails as a unit and never takes
//! its neighbours down with it.
//!
//! ## Retry Strategy
//!
//! Transport failures are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`, capped at one minute). A reply that arrives but cannot be
//! used (malformed JSON, an `error` field, mismatched slide numbers) is final
//! for that batch: asking again would only burn another generation.

use crate::config::PipelineConfig;
use crate::error::{BatchError, CollaboratorError};
use crate::output::{BatchReport, ImageAnalysis, PageRecord};
use crate::prompts::{script_request, DEFAULT_PRESENTER_PROMPT};
use crate::state::RunContext;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// One slide as sent to the scripting service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptInput {
    pub slide_number: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_analysis: Option<ImageAnalysis>,
}

impl ScriptInput {
    pub fn from_page(page: &PageRecord) -> Self {
        Self {
            slide_number: page.page_num,
            text: page.text.clone(),
            image_analysis: page.analysis.clone().filter(|a| !a.is_empty()),
        }
    }
}

/// One slide as returned by the scripting service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptedSlide {
    pub slide_number: usize,
    pub presentation_text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptResponse {
    Slides(Vec<ScriptedSlide>),
    Failure { error: serde_json::Value },
}

/// The external narration generator.
#[async_trait]
pub trait NarrationScripter: Send + Sync {
    /// Send one batch and return the raw reply text.
    async fn script(&self, batch: &[ScriptInput]) -> Result<String, CollaboratorError>;
}

/// Narration via an `edgequake-llm` chat provider.
pub struct LlmScripter {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    options: CompletionOptions,
}

impl LlmScripter {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PRESENTER_PROMPT.to_string()),
            options: build_options(config),
        }
    }
}

#[async_trait]
impl NarrationScripter for LlmScripter {
    async fn script(&self, batch: &[ScriptInput]) -> Result<String, CollaboratorError> {
        let payload =
            serde_json::to_string_pretty(batch).map_err(|e| CollaboratorError::Malformed(e.to_string()))?;
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(script_request(&payload)),
        ];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;
        debug!(
            "Scripting call: {} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Split `len` pages into consecutive ranges of at most `size`.
pub fn partition_batches(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len.div_ceil(size))
        .map(|b| b * size..((b + 1) * size).min(len))
        .collect()
}

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Remove one outer Markdown code fence, if the model added it anyway.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    match RE_CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => trimmed,
    }
}

/// Parse and validate one batch reply.
///
/// Returns narration keyed by page number. `expected` holds the batch's page
/// numbers; the reply must name each of them exactly once and nothing else.
pub fn parse_script_response(
    batch: usize,
    raw: &str,
    expected: &[usize],
) -> Result<HashMap<usize, String>, BatchError> {
    let body = strip_code_fences(raw);
    let parsed: ScriptResponse =
        serde_json::from_str(body).map_err(|e| BatchError::MalformedResponse {
            batch,
            detail: e.to_string(),
        })?;

    let slides = match parsed {
        ScriptResponse::Slides(slides) => slides,
        ScriptResponse::Failure { error } => {
            let message = match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(BatchError::ServiceError { batch, message });
        }
    };

    let got: Vec<usize> = slides.iter().map(|s| s.slide_number).collect();
    let mut got_sorted = got.clone();
    got_sorted.sort_unstable();
    let mut want = expected.to_vec();
    want.sort_unstable();
    if got_sorted != want {
        return Err(BatchError::PageMismatch {
            batch,
            expected: expected.to_vec(),
            got,
        });
    }

    Ok(slides
        .into_iter()
        .map(|s| (s.slide_number, s.presentation_text))
        .collect())
}

/// Longest wait between two scripting attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// `base_ms * 2^(attempt-1)`, saturating and capped at [`MAX_BACKOFF`].
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// Call the scripter with retry/backoff; transport errors only.
async fn call_with_retry(
    scripter: &dyn NarrationScripter,
    batch: usize,
    inputs: &[ScriptInput],
    config: &PipelineConfig,
) -> Result<String, BatchError> {
    let mut last_err: Option<String> = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay(config.retry_backoff_ms, attempt);
            warn!(
                "Batch {}: retry {}/{} after {}ms",
                batch,
                attempt,
                config.max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }
        match scripter.script(inputs).await {
            Ok(raw) => return Ok(raw),
            Err(e) => {
                warn!("Batch {}: attempt {} failed: {}", batch, attempt + 1, e);
                last_err = Some(e.to_string());
            }
        }
    }
    Err(BatchError::CallFailed {
        batch,
        retries: config.max_retries,
        detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
    })
}

/// Script every batch in order, writing narration onto `pages`.
///
/// Stops before the next batch once the run is cancelled; the reports
/// returned cover only the batches that ran.
pub async fn script_batches(
    ctx: &RunContext,
    pages: &mut [PageRecord],
    scripter: &dyn NarrationScripter,
    config: &PipelineConfig,
) -> Vec<BatchReport> {
    let batches = partition_batches(pages.len(), config.batch_size);
    let total = batches.len();
    info!(
        "Scripting {} pages in {} batches of up to {}",
        pages.len(),
        total,
        config.batch_size
    );

    let mut reports = Vec::with_capacity(total);
    for (batch, range) in batches.into_iter().enumerate() {
        if !ctx.should_continue() {
            info!("Run stopped before batch {}", batch);
            break;
        }
        let slice = &mut pages[range];
        let page_nums: Vec<usize> = slice.iter().map(|p| p.page_num).collect();
        let inputs: Vec<ScriptInput> = slice.iter().map(ScriptInput::from_page).collect();

        let outcome = match call_with_retry(scripter, batch, &inputs, config).await {
            Ok(raw) => parse_script_response(batch, &raw, &page_nums),
            Err(e) => Err(e),
        };

        let mut narrated = 0;
        let error = match outcome {
            Ok(mut narration) => {
                for page in slice.iter_mut() {
                    match narration.remove(&page.page_num) {
                        Some(text) if !text.trim().is_empty() => {
                            page.narration = Some(text);
                            narrated += 1;
                        }
                        _ => debug!("Page {}: empty narration", page.page_num),
                    }
                }
                info!("Batch {}: narrated {} of {} pages", batch, narrated, page_nums.len());
                None
            }
            Err(e) => {
                error!("{}", e);
                Some(e)
            }
        };

        if let Some(ref cb) = config.progress_callback {
            cb.on_batch_scripted(batch, total, narrated);
        }
        reports.push(BatchReport {
            batch,
            pages: page_nums,
            error,
        });
    }
    reports
}
