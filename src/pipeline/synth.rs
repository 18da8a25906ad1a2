//! Narration synthesis stage: narration text → one WAV file per page.

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, NarrateError, PageError};
use crate::output::PageRecord;
use crate::state::{RunContext, Stage};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The external speech synthesiser.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text` to audio bytes (a complete WAV file).
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Voice selection for [`GoogleTtsSynthesizer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelection {
    pub language_code: String,
    pub name: String,
    pub ssml_gender: String,
}

impl Default for VoiceSelection {
    fn default() -> Self {
        Self {
            language_code: "en-US".to_string(),
            name: "en-US-Wavenet-F".to_string(),
            ssml_gender: "FEMALE".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: &'a VoiceSelection,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

/// Google Cloud Text-to-Speech over its REST API, LINEAR16 output.
#[derive(Debug, Clone)]
pub struct GoogleTtsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    voice: VoiceSelection,
}

impl GoogleTtsSynthesizer {
    pub const DEFAULT_ENDPOINT: &'static str =
        "https://texttospeech.googleapis.com/v1/text:synthesize";

    pub fn new(api_key: impl Into<String>) -> Result<Self, NarrateError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(NarrateError::CollaboratorNotConfigured {
                name: "google-tts".into(),
                hint: "Set GOOGLE_TTS_API_KEY to a Cloud Text-to-Speech API key.".into(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| NarrateError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            voice: VoiceSelection::default(),
        })
    }

    /// Build from `GOOGLE_TTS_API_KEY`.
    pub fn from_env() -> Result<Self, NarrateError> {
        Self::new(std::env::var("GOOGLE_TTS_API_KEY").unwrap_or_default())
    }

    /// Send requests somewhere other than the public Google endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleTtsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        let request = SynthesizeRequest {
            input: SynthesisInput { text },
            voice: &self.voice,
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16",
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(CollaboratorError::Http(format!(
                "synthesis failed with status {status}: {body}"
            )));
        }

        let body: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Malformed(e.to_string()))?;
        STANDARD
            .decode(body.audio_content.as_bytes())
            .map_err(|e| CollaboratorError::Malformed(format!("audioContent: {e}")))
    }
}

/// `<first N chars of the source file name>-slide_audio<page>.wav`.
pub fn audio_file_name(source_name: &str, prefix_chars: usize, page_num: usize) -> String {
    let prefix: String = source_name.chars().take(prefix_chars).collect();
    format!("{prefix}-slide_audio{page_num}.wav")
}

/// Synthesise every narrated page into `output_dir`, in page order.
///
/// Pages without narration are skipped. Stops before the next page once the
/// run is cancelled.
pub async fn synthesize_pages(
    ctx: &RunContext,
    pages: &mut [PageRecord],
    synthesizer: &dyn SpeechSynthesizer,
    source_name: &str,
    output_dir: &Path,
    config: &PipelineConfig,
) {
    let total = pages.len();
    let narrated = pages.iter().filter(|p| p.narration.is_some()).count();
    info!("Synthesising audio for {} of {} pages", narrated, total);

    for page in pages.iter_mut() {
        let Some(narration) = page.narration.as_deref() else {
            continue;
        };
        if !ctx.should_continue() {
            info!("Run stopped before synthesising page {}", page.page_num);
            return;
        }

        let path = output_dir.join(audio_file_name(
            source_name,
            config.audio_prefix_chars,
            page.page_num,
        ));
        debug!("Page {}: synthesising to {}", page.page_num, path.display());

        let result = match synthesizer.synthesize(narration).await {
            Ok(audio) => tokio::fs::write(&path, &audio)
                .await
                .map_err(|e| format!("cannot write {}: {e}", path.display())),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                info!("Page {}: audio written to {}", page.page_num, path.display());
                page.audio_path = Some(path);
                if let Some(ref cb) = config.progress_callback {
                    cb.on_page_synthesized(page.page_num, total);
                }
            }
            Err(detail) => {
                let err = PageError::SynthesisFailed {
                    page: page.page_num,
                    detail,
                };
                warn!("{}", err);
                if let Some(ref cb) = config.progress_callback {
                    cb.on_page_error(page.page_num, Stage::Synthesizing, &err.to_string());
                }
                page.errors.push(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunState;
    use std::path::PathBuf;

    #[test]
    fn audio_names_truncate_by_characters() {
        assert_eq!(
            audio_file_name("Quarterly-Review.pptx", 10, 3),
            "Quarterly--slide_audio3.wav"
        );
        assert_eq!(audio_file_name("a.pptx", 10, 12), "a.pptx-slide_audio12.wav");
        assert_eq!(audio_file_name("ÄÖÜäöüßéèêë.pptx", 10, 1), "ÄÖÜäöüßéèê-slide_audio1.wav");
    }

    #[test]
    fn request_body_matches_rest_shape() {
        let voice = VoiceSelection::default();
        let req = SynthesizeRequest {
            input: SynthesisInput { text: "Hello" },
            voice: &voice,
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16",
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["input"]["text"], "Hello");
        assert_eq!(json["voice"]["languageCode"], "en-US");
        assert_eq!(json["voice"]["name"], "en-US-Wavenet-F");
        assert_eq!(json["voice"]["ssmlGender"], "FEMALE");
        assert_eq!(json["audioConfig"]["audioEncoding"], "LINEAR16");
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        assert!(matches!(
            GoogleTtsSynthesizer::new("  "),
            Err(NarrateError::CollaboratorNotConfigured { .. })
        ));
    }

    /// Local stand-in for the Text-to-Speech REST endpoint. Echoes the
    /// request text back as `RIFF<text>`; rejects any key but `test-key`.
    #[cfg(feature = "server")]
    async fn tts_stand_in() -> String {
        use axum::extract::Query;
        use axum::http::StatusCode;
        use axum::{routing::post, Json, Router};
        use std::collections::HashMap;

        let app = Router::new().route(
            "/synthesize",
            post(
                |Query(q): Query<HashMap<String, String>>, Json(body): Json<serde_json::Value>| async move {
                    if q.get("key").map(String::as_str) != Some("test-key") {
                        return (
                            StatusCode::FORBIDDEN,
                            Json(serde_json::json!({"error": "bad key"})),
                        );
                    }
                    let text = body["input"]["text"].as_str().unwrap_or_default();
                    let audio = STANDARD.encode(format!("RIFF{text}"));
                    (StatusCode::OK, Json(serde_json::json!({ "audioContent": audio })))
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/synthesize")
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn google_tts_decodes_audio_content() {
        let endpoint = tts_stand_in().await;
        let tts = GoogleTtsSynthesizer::new("test-key")
            .unwrap()
            .with_endpoint(endpoint);
        let audio = tts.synthesize("Hello").await.unwrap();
        assert_eq!(audio, b"RIFFHello");
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn google_tts_error_status_is_an_http_error() {
        let endpoint = tts_stand_in().await;
        let tts = GoogleTtsSynthesizer::new("wrong-key")
            .unwrap()
            .with_endpoint(endpoint);
        match tts.synthesize("Hello").await {
            Err(CollaboratorError::Http(msg)) => {
                assert!(msg.contains("403"), "{msg}");
                assert!(msg.contains("bad key"), "{msg}");
            }
            other => panic!("expected an HTTP error, got {other:?}"),
        }
    }

    struct FakeSynth;

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
            if text.contains("fail") {
                Err(CollaboratorError::Http("quota exceeded".into()))
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages: Vec<PageRecord> = (1..=4)
            .map(|n| PageRecord::new(n, PathBuf::from(format!("slide_{}.png", n - 1)), String::new()))
            .collect();
        pages[0].narration = Some("one".into());
        pages[1].narration = Some("please fail".into());
        pages[3].narration = Some("four".into());

        let state = RunState::new();
        let config = PipelineConfig::default();
        let ctx = RunContext::begin(&state, &config).unwrap();
        synthesize_pages(&ctx, &mut pages, &FakeSynth, "deck.pptx", dir.path(), &config).await;

        let p1 = pages[0].audio_path.as_ref().unwrap();
        assert!(p1.ends_with("deck.pptx-slide_audio1.wav"));
        assert_eq!(std::fs::read(p1).unwrap(), b"one");
        assert!(pages[1].audio_path.is_none());
        assert!(matches!(
            pages[1].errors[..],
            [PageError::SynthesisFailed { page: 2, .. }]
        ));
        assert!(pages[2].audio_path.is_none());
        assert!(pages[2].errors.is_empty());
        assert!(pages[3].audio_path.is_some());
    }
}
