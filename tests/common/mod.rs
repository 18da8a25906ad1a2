//! In-process collaborators for integration tests: no subprocesses, no network.

#![allow(dead_code)]

use async_trait::async_trait;
use slidecast::pipeline::convert::DocumentConverter;
use slidecast::pipeline::dispatch::AvatarSink;
use slidecast::pipeline::recognize::TextRecognizer;
use slidecast::pipeline::script::{NarrationScripter, ScriptInput};
use slidecast::pipeline::synth::SpeechSynthesizer;
use slidecast::pipeline::vision::VisionAnalyzer;
use slidecast::{CollaboratorError, Collaborators, ImageAnalysis, PipelineConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Writes `<stem>.pdf` and `slide_0..slide_{pages-1}` placeholder images.
pub struct FakeConverter {
    pub pages: usize,
    /// Never write the PDF (simulates a converter that silently does nothing).
    pub skip_pdf: bool,
}

#[async_trait]
impl DocumentConverter for FakeConverter {
    async fn to_pdf(&self, source: &Path, out_dir: &Path) -> Result<(), CollaboratorError> {
        if self.skip_pdf {
            return Ok(());
        }
        let stem = source.file_stem().unwrap().to_string_lossy().into_owned();
        std::fs::write(out_dir.join(format!("{stem}.pdf")), b"%PDF-1.4\n")?;
        Ok(())
    }

    async fn rasterize(
        &self,
        _pdf: &Path,
        out_dir: &Path,
        _density: u32,
        ext: &str,
    ) -> Result<(), CollaboratorError> {
        for i in 0..self.pages {
            std::fs::write(out_dir.join(format!("slide_{i}.{ext}")), b"image")?;
        }
        Ok(())
    }
}

/// Returns `"Text of slide_<n>"`. Lower-numbered images take longer, so
/// workers finish out of page order.
pub struct FakeRecognizer {
    pub pages: usize,
    /// Images deleted right after being read, so enrichment finds them gone.
    pub vanish: HashSet<String>,
}

impl TextRecognizer for FakeRecognizer {
    fn recognize(&self, image: &Path) -> Result<String, CollaboratorError> {
        let stem = image.file_stem().unwrap().to_string_lossy().into_owned();
        let index: usize = stem.trim_start_matches("slide_").parse().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(
            (self.pages.saturating_sub(index) as u64) * 3,
        ));
        if self.vanish.contains(&stem) {
            std::fs::remove_file(image)?;
        }
        Ok(format!("Text of {stem}"))
    }
}

/// Describes every slide; never overrides the recognised text.
pub struct FakeAnalyzer;

#[async_trait]
impl VisionAnalyzer for FakeAnalyzer {
    async fn analyze(&self, image: &Path) -> Result<ImageAnalysis, CollaboratorError> {
        Ok(ImageAnalysis {
            description: format!("A slide rendered to {}", image.display()),
            tags: vec!["chart".into()],
            ..Default::default()
        })
    }
}

/// Narrates every slide it is given, except batches containing a page in
/// `malformed`, which get a non-JSON reply.
#[derive(Default)]
pub struct FakeScripter {
    pub malformed: HashSet<usize>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Vec<usize>>>,
}

#[async_trait]
impl NarrationScripter for FakeScripter {
    async fn script(&self, batch: &[ScriptInput]) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push(batch.iter().map(|s| s.slide_number).collect());
        if batch.iter().any(|s| self.malformed.contains(&s.slide_number)) {
            return Ok("Sorry, I cannot help with that.".to_string());
        }
        let slides: Vec<serde_json::Value> = batch
            .iter()
            .map(|s| {
                serde_json::json!({
                    "slide_number": s.slide_number,
                    "presentation_text": format!("Narration for slide {}: {}", s.slide_number, s.text),
                })
            })
            .collect();
        Ok(format!(
            "```json\n{}\n```",
            serde_json::to_string_pretty(&slides).unwrap()
        ))
    }
}

/// Audio bytes are the narration text itself.
pub struct FakeSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        Ok(text.as_bytes().to_vec())
    }
}

/// Records every push with its arrival time.
#[derive(Default)]
pub struct RecordingAvatar {
    pub pushed: Mutex<Vec<(PathBuf, String, Instant)>>,
    /// Delay each push by this long before acknowledging.
    pub latency: Duration,
}

impl RecordingAvatar {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _, _)| p.clone())
            .collect()
    }
}

#[async_trait]
impl AvatarSink for RecordingAvatar {
    async fn push(&self, audio: &Path, instance: &str) -> Result<(), CollaboratorError> {
        self.pushed
            .lock()
            .unwrap()
            .push((audio.to_path_buf(), instance.to_string(), Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }
}

/// Handles on the fakes a test wants to inspect afterwards.
pub struct Fakes {
    pub collaborators: Collaborators,
    pub scripter: Arc<FakeScripter>,
    pub avatar: Arc<RecordingAvatar>,
}

pub fn fakes(pages: usize) -> Fakes {
    fakes_with(
        FakeConverter {
            pages,
            skip_pdf: false,
        },
        FakeRecognizer {
            pages,
            vanish: HashSet::new(),
        },
        FakeScripter::default(),
    )
}

pub fn fakes_with(
    converter: FakeConverter,
    recognizer: FakeRecognizer,
    scripter: FakeScripter,
) -> Fakes {
    let scripter = Arc::new(scripter);
    let avatar = Arc::new(RecordingAvatar::default());
    Fakes {
        collaborators: Collaborators {
            converter: Arc::new(converter),
            recognizer: Arc::new(recognizer),
            analyzer: Arc::new(FakeAnalyzer),
            scripter: scripter.clone(),
            synthesizer: Arc::new(FakeSynthesizer),
            avatar: avatar.clone(),
        },
        scripter,
        avatar,
    }
}

/// Short waits and pacing so a whole run takes well under a second.
pub fn fast_config() -> slidecast::PipelineConfigBuilder {
    PipelineConfig::builder()
        .recognition_workers(4)
        .file_wait_timeout_secs(1)
        .poll_interval_ms(10)
        .dispatch_delay_ms(30)
        .max_retries(1)
        .retry_backoff_ms(1)
}

/// A placeholder deck at `<dir>/<name>`.
pub fn write_deck(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"PK\x03\x04 not really a deck").unwrap();
    path
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
