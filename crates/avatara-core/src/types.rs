//! Shared types for the avatara session pipeline.
//!
//! Everything here is plain data: configuration, audio chunks, eventpoints and
//! status snapshots. Keeping them in avatara-core lets API consumers depend on
//! the types without pulling in tokio, ort, or the image stack.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::wav::SAMPLE_RATE;

// ─── Audio chunks ──────────────────────────────────────────────────────────

/// What produced an [`AudioChunk`]. Serialized as the numeric "audiotype"
/// used by the control API: 0 speech, 1 silence, 2+ custom clip ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ChunkKind {
    Speech,
    Silence,
    Custom(u32),
}

impl ChunkKind {
    pub fn id(self) -> u32 {
        match self {
            ChunkKind::Speech => 0,
            ChunkKind::Silence => 1,
            ChunkKind::Custom(id) => id,
        }
    }

    pub fn is_speech(self) -> bool {
        self == ChunkKind::Speech
    }
}

impl From<u32> for ChunkKind {
    fn from(id: u32) -> Self {
        match id {
            0 => ChunkKind::Speech,
            1 => ChunkKind::Silence,
            other => ChunkKind::Custom(other),
        }
    }
}

impl From<ChunkKind> for u32 {
    fn from(kind: ChunkKind) -> Self {
        kind.id()
    }
}

/// Utterance boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Start,
    End,
}

/// Metadata attached to the first and last chunk of an utterance and handed to
/// the transport's notify callback when the chunk is played out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPoint {
    pub status: EventStatus,
    pub text: String,
    /// Opaque caller payload, echoed back untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msgevent: Option<serde_json::Value>,
}

impl EventPoint {
    pub fn start(text: &str, msgevent: Option<serde_json::Value>) -> Self {
        Self {
            status: EventStatus::Start,
            text: text.to_string(),
            msgevent,
        }
    }

    pub fn end(text: &str, msgevent: Option<serde_json::Value>) -> Self {
        Self {
            status: EventStatus::End,
            text: text.to_string(),
            msgevent,
        }
    }
}

/// One fixed-duration slice of 16 kHz mono PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub kind: ChunkKind,
    pub eventpoint: Option<EventPoint>,
}

impl AudioChunk {
    pub fn speech(samples: Vec<f32>, eventpoint: Option<EventPoint>) -> Self {
        Self {
            samples,
            kind: ChunkKind::Speech,
            eventpoint,
        }
    }

    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
            kind: ChunkKind::Silence,
            eventpoint: None,
        }
    }
}

/// Pixel box inside a frame, half-open on the right and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Region {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whether the box lies entirely inside a `width` x `height` frame.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        !self.is_empty() && self.x2 <= width && self.y2 <= height
    }
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// Per-session pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Audio chunks per second. Video runs at half this rate.
    pub fps: u32,
    /// Video frames per inference batch.
    pub batch_size: usize,
    /// Left context, in audio chunks, kept in the feature window.
    pub stride_left: usize,
    /// Right context, in audio chunks, kept in the feature window.
    pub stride_right: usize,
    /// Transport backlog above `backlog_factor * batch_size` throttles the pacer.
    pub backlog_factor: f32,
    /// Upper bound for every blocking queue read.
    #[serde(with = "duration_ms")]
    pub queue_timeout: Duration,
    /// Pace emission to wall-clock time. Disabled for offline rendering.
    pub realtime: bool,
    /// Zero-pad a trailing partial chunk instead of dropping it.
    pub pad_partial_chunk: bool,
    pub record_dir: PathBuf,
    pub ffmpeg: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fps: 50,
            batch_size: 16,
            stride_left: 10,
            stride_right: 10,
            backlog_factor: 1.5,
            queue_timeout: Duration::from_secs(1),
            realtime: true,
            pad_partial_chunk: false,
            record_dir: PathBuf::from("data"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl SessionConfig {
    /// Samples per audio chunk.
    pub fn chunk_size(&self) -> usize {
        (SAMPLE_RATE / self.fps.max(1)) as usize
    }

    /// Video frames per second.
    pub fn video_fps(&self) -> u32 {
        self.fps / 2
    }

    /// Wall-clock length of one audio chunk.
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 || SAMPLE_RATE % self.fps != 0 {
            return Err(ConfigError::Invalid(format!(
                "fps {} must divide the {SAMPLE_RATE} Hz sample rate",
                self.fps
            )));
        }
        // Two audio chunks drive each video frame.
        if self.fps % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "fps {} must be even (two audio chunks per video frame)",
                self.fps
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.backlog_factor <= 0.0 {
            return Err(ConfigError::Invalid("backlog_factor must be positive".into()));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::Invalid("queue_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Which renderer and avatar identity a session uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Renderer variant: `wav2lip`, `ultralight`, `musetalk` or `static`.
    pub model: String,
    pub avatar_id: String,
    pub avatars_dir: PathBuf,
    /// Renderer weights. Defaults to `<avatars_dir>/<avatar_id>/<model>.onnx`.
    pub model_path: Option<PathBuf>,
    /// Run one zero-input batch after loading.
    pub warm_up: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "wav2lip".into(),
            avatar_id: "avator_1".into(),
            avatars_dir: PathBuf::from("data/avatars"),
            model_path: None,
            warm_up: true,
        }
    }
}

impl ModelConfig {
    pub fn avatar_path(&self) -> PathBuf {
        self.avatars_dir.join(&self.avatar_id)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| self.avatar_path().join(format!("{}.onnx", self.model)))
    }
}

/// Speech synthesis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub kokoro_url: String,
    pub voice: String,
    pub speed: f32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            kokoro_url: "http://localhost:3001".into(),
            voice: "af_heart".into(),
            speed: 1.0,
        }
    }
}

/// One configured custom clip (`customopt` entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomClipConfig {
    pub audiotype: u32,
    pub imgpath: PathBuf,
    pub audiopath: PathBuf,
}

impl CustomClipConfig {
    /// Parse a JSON list of clip entries.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, ConfigError> {
        let clips: Vec<Self> = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("invalid customopt: {e}")))?;
        for clip in &clips {
            if clip.audiotype <= 1 {
                return Err(ConfigError::Invalid(format!(
                    "custom audiotype {} collides with reserved speech/silence ids",
                    clip.audiotype
                )));
            }
        }
        Ok(clips)
    }
}

// ─── Status ────────────────────────────────────────────────────────────────

/// Session status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: u32,
    pub speaking: bool,
    pub custom_state: u32,
    pub recording: bool,
    pub slots_emitted: u64,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
