//! Configuration types for a narration run.
//!
//! Every pipeline knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The CLI and the HTTP surface share it.

use crate::error::NarrateError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::time::Duration;

/// Configuration for one narration run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use slidecast::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .batch_size(5)
///     .recognition_workers(4)
///     .dispatch_delay_ms(3000)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rasteriser density in DPI. Range: 72–600. Default: 150.
    ///
    /// 150 DPI keeps slide text crisp enough for recognition while the PNGs
    /// stay small enough to upload to the vision model.
    pub density: u32,

    /// Extension of the rasterised page images, without the dot. Default: `png`.
    pub image_extension: String,

    /// Number of concurrent recognition workers. Default: `min(8, cores - 1)`, at least 1.
    ///
    /// Recognition is the one CPU-bound stage; leaving a core free keeps the
    /// orchestrator and the HTTP surface responsive while the pool is busy.
    pub recognition_workers: usize,

    /// Per-page recognition timeout in seconds. Default: 60.
    pub recognition_timeout_secs: u64,

    /// How long a single file-readiness wait may last, in seconds. Default: 30.
    pub file_wait_timeout_secs: u64,

    /// Interval between file-existence polls, in milliseconds. Default: 1000.
    pub poll_interval_ms: u64,

    /// Upper bound on the sum of all file-readiness waits in one run, in seconds. Default: 300.
    ///
    /// Each page of the enrichment stage may wait for its image. Without a
    /// run-level cap, a deck whose images never appear would stall for
    /// `pages × file_wait_timeout_secs`.
    pub max_total_wait_secs: u64,

    /// Pages per scripting call. Default: 5.
    pub batch_size: usize,

    /// Pause between avatar dispatches, in milliseconds. Default: 3000.
    ///
    /// The avatar renders audio in real time; pushing faster than playback
    /// overruns its input buffer.
    pub dispatch_delay_ms: u64,

    /// Wait for outstanding avatar pushes before reporting `completed`. Default: true.
    ///
    /// Pushes still in flight when a run is stopped are always abandoned.
    pub await_dispatches: bool,

    /// Characters of the source filename used as the audio file prefix. Default: 10.
    pub audio_prefix_chars: usize,

    /// Avatar instance that receives the audio. Default: `/World/audio2face/PlayerStreaming`.
    pub avatar_instance: String,

    /// Accepted source extensions, lowercase, without the dot. Default: `["pptx"]`.
    pub allowed_extensions: Vec<String>,

    /// Longest edge, in pixels, of page images sent to the vision model. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Sampling temperature for the scripting model. Default: 0.7.
    ///
    /// Narration should read like a human presenter, so this runs warmer than
    /// a transcription task would.
    pub temperature: f32,

    /// Maximum tokens the scripting model may generate per batch. Default: 4096.
    pub max_tokens: usize,

    /// Retries for a scripting call that fails in transport. Default: 3.
    ///
    /// Malformed responses are not retried; they fail the batch immediately.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom presenter instructions. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Write `manifest.json` into the output directory. Default: true.
    pub write_manifest: bool,

    /// Optional progress callback invoked as the run advances.
    pub progress_callback: Option<ProgressCallback>,
}

/// `min(8, available_parallelism - 1)`, never below one worker.
pub fn default_recognition_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cores.saturating_sub(1).clamp(1, 8)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            density: 150,
            image_extension: "png".to_string(),
            recognition_workers: default_recognition_workers(),
            recognition_timeout_secs: 60,
            file_wait_timeout_secs: 30,
            poll_interval_ms: 1000,
            max_total_wait_secs: 300,
            batch_size: 5,
            dispatch_delay_ms: 3000,
            await_dispatches: true,
            audio_prefix_chars: 10,
            avatar_instance: "/World/audio2face/PlayerStreaming".to_string(),
            allowed_extensions: vec!["pptx".to_string()],
            max_rendered_pixels: 2000,
            temperature: 0.7,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
            write_manifest: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("density", &self.density)
            .field("image_extension", &self.image_extension)
            .field("recognition_workers", &self.recognition_workers)
            .field("recognition_timeout_secs", &self.recognition_timeout_secs)
            .field("file_wait_timeout_secs", &self.file_wait_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_total_wait_secs", &self.max_total_wait_secs)
            .field("batch_size", &self.batch_size)
            .field("dispatch_delay_ms", &self.dispatch_delay_ms)
            .field("await_dispatches", &self.await_dispatches)
            .field("avatar_instance", &self.avatar_instance)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }

    pub fn file_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.file_wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_secs(self.max_total_wait_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }

    /// Whether `extension` (any case, no dot) is an accepted source type.
    pub fn accepts_extension(&self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|a| *a == ext)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn density(mut self, dpi: u32) -> Self {
        self.config.density = dpi.clamp(72, 600);
        self
    }

    pub fn image_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.image_extension = ext.into().trim_start_matches('.').to_ascii_lowercase();
        self
    }

    pub fn recognition_workers(mut self, n: usize) -> Self {
        self.config.recognition_workers = n.max(1);
        self
    }

    pub fn recognition_timeout_secs(mut self, secs: u64) -> Self {
        self.config.recognition_timeout_secs = secs;
        self
    }

    pub fn file_wait_timeout_secs(mut self, secs: u64) -> Self {
        self.config.file_wait_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(1);
        self
    }

    pub fn max_total_wait_secs(mut self, secs: u64) -> Self {
        self.config.max_total_wait_secs = secs;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n.max(1);
        self
    }

    pub fn dispatch_delay_ms(mut self, ms: u64) -> Self {
        self.config.dispatch_delay_ms = ms;
        self
    }

    pub fn await_dispatches(mut self, v: bool) -> Self {
        self.config.await_dispatches = v;
        self
    }

    pub fn audio_prefix_chars(mut self, n: usize) -> Self {
        self.config.audio_prefix_chars = n.max(1);
        self
    }

    pub fn avatar_instance(mut self, instance: impl Into<String>) -> Self {
        self.config.avatar_instance = instance.into();
        self
    }

    pub fn allowed_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.allowed_extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn write_manifest(mut self, v: bool) -> Self {
        self.config.write_manifest = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, NarrateError> {
        let c = &self.config;
        if c.image_extension.is_empty() {
            return Err(NarrateError::InvalidConfig(
                "Image extension must not be empty".into(),
            ));
        }
        if c.allowed_extensions.is_empty() {
            return Err(NarrateError::InvalidConfig(
                "At least one source extension must be allowed".into(),
            ));
        }
        if c.recognition_timeout_secs == 0 {
            return Err(NarrateError::InvalidConfig(
                "Recognition timeout must be ≥ 1s".into(),
            ));
        }
        if c.avatar_instance.trim().is_empty() {
            return Err(NarrateError::InvalidConfig(
                "Avatar instance must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
