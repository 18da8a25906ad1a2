//! Vision enrichment stage: attach image analysis to each page.
//!
//! Enrichment is additive. A missing image or an unavailable analyzer leaves
//! the page with its recognition text and an empty analysis; it never fails
//! the page, let alone the run.

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, PageError};
use crate::output::{ImageAnalysis, PageRecord};
use crate::pipeline::convert::page_image_path;
use crate::pipeline::encode::encode_page_file;
use crate::pipeline::script::strip_code_fences;
use crate::prompts::VISION_ANALYSIS_PROMPT;
use crate::state::{RunContext, Stage};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The external image analyzer.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, image: &Path) -> Result<ImageAnalysis, CollaboratorError>;
}

/// Image analysis through a vision-capable `edgequake-llm` provider.
pub struct VlmAnalyzer {
    provider: Arc<dyn LLMProvider>,
    max_pixels: u32,
}

impl VlmAnalyzer {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            max_pixels: config.max_rendered_pixels,
        }
    }
}

#[async_trait]
impl VisionAnalyzer for VlmAnalyzer {
    async fn analyze(&self, image: &Path) -> Result<ImageAnalysis, CollaboratorError> {
        let path = image.to_path_buf();
        let max_pixels = self.max_pixels;
        let image_data = tokio::task::spawn_blocking(move || encode_page_file(&path, max_pixels))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("encode task panicked: {e}")))?
            .map_err(|e| CollaboratorError::Malformed(format!("cannot encode image: {e}")))?;

        let messages = vec![
            ChatMessage::system(VISION_ANALYSIS_PROMPT),
            ChatMessage::user_with_images("", vec![image_data]),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(2048),
            ..Default::default()
        };
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;

        serde_json::from_str(strip_code_fences(&response.content))
            .map_err(|e| CollaboratorError::Malformed(e.to_string()))
    }
}

/// Fold an analysis into a page: promote its text, store the rest.
///
/// The analyzer's text replaces the recognition text whenever it is present,
/// even when empty.
pub fn merge_analysis(page: &mut PageRecord, mut analysis: ImageAnalysis) {
    if let Some(text) = analysis.text.take() {
        page.text = text;
    }
    page.analysis = Some(analysis);
}

/// Enrich every page in order.
///
/// Returns early, leaving later pages untouched, once the run is cancelled.
pub async fn enrich_pages(
    ctx: &RunContext,
    pages: &mut [PageRecord],
    analyzer: &dyn VisionAnalyzer,
    image_dir: &Path,
    config: &PipelineConfig,
) {
    let total = pages.len();
    info!("Enriching {} pages with image analysis", total);

    for page in pages.iter_mut() {
        if !ctx.should_continue() {
            info!("Run stopped before enriching page {}", page.page_num);
            return;
        }

        let image = page_image_path(image_dir, page.page_num, &config.image_extension);
        let soft_error = if !ctx
            .await_file(&image, config.file_wait_timeout(), config.poll_interval())
            .await
        {
            page.analysis = Some(ImageAnalysis::default());
            Some(PageError::ImageMissing {
                page: page.page_num,
                path: image,
            })
        } else {
            match analyzer.analyze(&image).await {
                Ok(analysis) => {
                    debug!(
                        "Page {}: {} tags, {} objects, {} layout regions",
                        page.page_num,
                        analysis.tags.len(),
                        analysis.objects.len(),
                        analysis.layout.len()
                    );
                    merge_analysis(page, analysis);
                    None
                }
                Err(e) => {
                    page.analysis = Some(ImageAnalysis::default());
                    Some(PageError::AnalysisUnavailable {
                        page: page.page_num,
                        detail: e.to_string(),
                    })
                }
            }
        };

        if let Some(err) = soft_error {
            warn!("{}", err);
            if let Some(ref cb) = config.progress_callback {
                cb.on_page_error(page.page_num, Stage::Enriching, &err.to_string());
            }
            page.errors.push(err);
        }
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_enriched(page.page_num, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::DetectedObject;
    use crate::state::RunState;

    struct FakeAnalyzer;

    #[async_trait]
    impl VisionAnalyzer for FakeAnalyzer {
        async fn analyze(&self, image: &Path) -> Result<ImageAnalysis, CollaboratorError> {
            let name = image.file_name().unwrap().to_string_lossy().into_owned();
            match name.as_str() {
                "slide_0.png" => Ok(ImageAnalysis {
                    description: "A title slide".into(),
                    tags: vec!["person".into()],
                    objects: vec![DetectedObject {
                        name: "person".into(),
                        confidence: 0.9,
                        bbox: Some([1.0, 2.0, 3.0, 4.0]),
                    }],
                    layout: vec![],
                    text: Some("Welcome to Q3".into()),
                }),
                "slide_1.png" => Err(CollaboratorError::Unavailable("model offline".into())),
                _ => Ok(ImageAnalysis {
                    tags: vec!["chart".into()],
                    ..Default::default()
                }),
            }
        }
    }

    #[test]
    fn merge_promotes_text_and_strips_it_from_payload() {
        let mut page = PageRecord::new(1, "slide_0.png".into(), "ocr text".into());
        merge_analysis(
            &mut page,
            ImageAnalysis {
                text: Some(String::new()),
                tags: vec!["x".into()],
                ..Default::default()
            },
        );
        assert_eq!(page.text, "");
        assert!(page.analysis.as_ref().unwrap().text.is_none());

        let mut page = PageRecord::new(2, "slide_1.png".into(), "ocr text".into());
        merge_analysis(&mut page, ImageAnalysis::default());
        assert_eq!(page.text, "ocr text");
    }

    #[tokio::test]
    async fn enrichment_degrades_softly() {
        let dir = tempfile::tempdir().unwrap();
        // Pages 1–3 have images, page 4's never appears.
        for i in 0..3 {
            std::fs::write(dir.path().join(format!("slide_{i}.png")), b"png").unwrap();
        }
        let mut pages: Vec<PageRecord> = (1..=4)
            .map(|n| {
                PageRecord::new(
                    n,
                    page_image_path(dir.path(), n, "png"),
                    format!("ocr {n}"),
                )
            })
            .collect();

        let state = RunState::new();
        let config = PipelineConfig::builder()
            .file_wait_timeout_secs(0)
            .poll_interval_ms(5)
            .build()
            .unwrap();
        let ctx = RunContext::begin(&state, &config).unwrap();

        enrich_pages(&ctx, &mut pages, &FakeAnalyzer, dir.path(), &config).await;

        assert_eq!(pages[0].text, "Welcome to Q3");
        let a = pages[0].analysis.as_ref().unwrap();
        assert_eq!(a.objects[0].name, "person");
        assert!(a.text.is_none());

        assert_eq!(pages[1].text, "ocr 2");
        assert_eq!(pages[1].analysis, Some(ImageAnalysis::default()));
        assert!(matches!(
            pages[1].errors[..],
            [PageError::AnalysisUnavailable { page: 2, .. }]
        ));

        assert_eq!(pages[2].text, "ocr 3");
        assert_eq!(pages[2].analysis.as_ref().unwrap().tags, vec!["chart"]);

        assert_eq!(pages[3].text, "ocr 4");
        assert_eq!(pages[3].analysis, Some(ImageAnalysis::default()));
        assert!(matches!(
            pages[3].errors[..],
            [PageError::ImageMissing { page: 4, .. }]
        ));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_pages_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = vec![PageRecord::new(1, dir.path().join("slide_0.png"), "t".into())];
        let state = RunState::new();
        let config = PipelineConfig::default();
        let ctx = RunContext::begin(&state, &config).unwrap();
        state.cancel();
        enrich_pages(&ctx, &mut pages, &FakeAnalyzer, dir.path(), &config).await;
        assert!(pages[0].analysis.is_none());
    }
}
