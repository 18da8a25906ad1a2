//! Audio2Face gRPC client.
//!
//! Audio2Face exposes `nvidia.audio2face.Audio2Face/PushAudio`, a unary call
//! that takes the whole clip as mono little-endian `f32` samples. Only the
//! two messages this crate sends and receives are declared, by hand, with
//! `prost` derives; the call goes through tonic's generic client.
//!
//! A minute of 48 kHz audio is ~11 MiB of samples, well past tonic's 4 MiB
//! default decode limit, so both message limits are raised to 500 MiB.

use crate::error::{CollaboratorError, NarrateError};
use crate::pipeline::dispatch::AvatarSink;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

const MAX_MESSAGE_BYTES: usize = 500 * 1024 * 1024;
const PUSH_AUDIO_PATH: &str = "/nvidia.audio2face.Audio2Face/PushAudio";

/// Default gRPC port of the Audio2Face streaming player.
pub const DEFAULT_AVATAR_PORT: u16 = 50051;

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushAudioRequest {
    /// Prim path of the streaming player, e.g. `/World/audio2face/PlayerStreaming`.
    #[prost(string, tag = "1")]
    pub instance_name: String,
    #[prost(int32, tag = "2")]
    pub samplerate: i32,
    /// Mono `f32` samples, little-endian.
    #[prost(bytes = "vec", tag = "3")]
    pub audio_data: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub block_until_playback_is_finished: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushAudioResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Mono samples ready to push.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoClip {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl MonoClip {
    /// Samples as little-endian bytes, the wire layout Audio2Face expects.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Read a WAV file and mix every channel down to one.
pub fn load_mono_wav(path: &Path) -> Result<MonoClip, CollaboratorError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| CollaboratorError::Malformed(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    debug!("Loading WAV {}: {:?}", path.display(), spec);

    let interleaved: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Int => match spec.bits_per_sample {
            8 => reader
                .samples::<i8>()
                .map(|s| s.map(|v| v as f32 / i8::MAX as f32))
                .collect(),
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                .collect(),
            24 => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / 8_388_607.0))
                .collect(),
            32 => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
                .collect(),
            bits => {
                return Err(CollaboratorError::Malformed(format!(
                    "unsupported WAV bit depth: {bits}"
                )))
            }
        },
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
    };
    let interleaved = interleaved.map_err(|e| CollaboratorError::Malformed(e.to_string()))?;

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    Ok(MonoClip {
        sample_rate: spec.sample_rate,
        samples,
    })
}

/// Audio2Face streaming-player client.
#[derive(Debug, Clone)]
pub struct Audio2FaceClient {
    channel: Channel,
    url: String,
}

impl Audio2FaceClient {
    /// Build a client for `url` (`host:port` or `http://host:port`).
    ///
    /// The connection is established lazily on the first push.
    pub fn new(url: &str) -> Result<Self, NarrateError> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        let endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| NarrateError::CollaboratorNotConfigured {
                name: "audio2face".into(),
                hint: format!("Invalid avatar endpoint '{url}': {e}"),
            })?
            .connect_timeout(Duration::from_secs(10));
        Ok(Self {
            channel: endpoint.connect_lazy(),
            url,
        })
    }

    /// Build from `SLIDECAST_AVATAR_URL`, falling back to
    /// `HOST_IP_ADDRESS:50051`.
    pub fn from_env() -> Result<Self, NarrateError> {
        if let Ok(url) = std::env::var("SLIDECAST_AVATAR_URL") {
            if !url.trim().is_empty() {
                return Self::new(url.trim());
            }
        }
        match std::env::var("HOST_IP_ADDRESS") {
            Ok(host) if !host.trim().is_empty() => {
                Self::new(&format!("{}:{}", host.trim(), DEFAULT_AVATAR_PORT))
            }
            _ => Err(NarrateError::CollaboratorNotConfigured {
                name: "audio2face".into(),
                hint: "Set SLIDECAST_AVATAR_URL (e.g. 192.168.1.20:50051) or HOST_IP_ADDRESS."
                    .into(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request and check the player's verdict.
    pub async fn push_clip(
        &self,
        clip: &MonoClip,
        instance: &str,
    ) -> Result<(), CollaboratorError> {
        let request = PushAudioRequest {
            instance_name: instance.to_string(),
            samplerate: i32::try_from(clip.sample_rate)
                .map_err(|_| CollaboratorError::Malformed("sample rate out of range".into()))?,
            audio_data: clip.to_le_bytes(),
            block_until_playback_is_finished: true,
        };

        let mut grpc = tonic::client::Grpc::new(self.channel.clone())
            .max_encoding_message_size(MAX_MESSAGE_BYTES)
            .max_decoding_message_size(MAX_MESSAGE_BYTES);
        grpc.ready()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("{}: {e}", self.url)))?;

        let codec: ProstCodec<PushAudioRequest, PushAudioResponse> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(PUSH_AUDIO_PATH),
                codec,
            )
            .await
            .map_err(|status| {
                CollaboratorError::Rpc(format!("{} ({:?})", status.message(), status.code()))
            })?
            .into_inner();

        if response.success {
            Ok(())
        } else {
            Err(CollaboratorError::Rpc(response.message))
        }
    }
}

#[async_trait]
impl AvatarSink for Audio2FaceClient {
    async fn push(&self, audio: &Path, instance: &str) -> Result<(), CollaboratorError> {
        let path = audio.to_path_buf();
        let clip = tokio::task::spawn_blocking(move || load_mono_wav(&path))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("WAV task panicked: {e}")))??;
        debug!(
            "Pushing {} ({} samples @ {} Hz) to {}",
            audio.display(),
            clip.samples.len(),
            clip.sample_rate,
            instance
        );
        self.push_clip(&clip, instance).await?;
        info!("Audio {} delivered to {}", audio.display(), instance);
        Ok(())
    }
}
