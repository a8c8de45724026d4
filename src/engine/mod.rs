//! # Inference Engine Boundary
//!
//! Traits and data types at the seam between the model lifecycle manager and
//! the actual speech-to-text implementation. The manager only ever sees
//! `EngineFactory` and `SpeechEngine`; everything candle-specific lives behind
//! them in [`whisper`].

pub mod audio;
pub mod whisper;

use crate::device::{ComputeType, DeviceKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Model identifiers this service advertises.
pub const MODEL_CATALOG: &[&str] = &[
    "tiny",
    "tiny.en",
    "base",
    "base.en",
    "small",
    "small.en",
    "medium",
    "medium.en",
    "large-v1",
    "large-v2",
    "large-v3",
    "large-v3-turbo",
    "distil-large-v2",
    "distil-large-v3",
];

/// Per-request transcription options.
#[derive(Debug, Clone, Serialize)]
pub struct TranscribeOptions {
    /// Language hint (ISO 639-1 code like "en"); auto-detected when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Whether to attach per-word timings to each segment
    pub word_timestamps: bool,

    /// Decoder beam width; accepted for API compatibility, the candle engine
    /// decodes greedily regardless
    pub beam_size: usize,

    /// Skip stretches of audio below the energy floor before decoding
    pub vad_filter: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            word_timestamps: false,
            beam_size: 5,
            vad_filter: true,
        }
    }
}

/// Per-word timing inside a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub start: f64,
    pub end: f64,
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
}

/// One timed span of transcribed text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub words: Option<Vec<Word>>,
}

/// Complete result of transcribing one audio source.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// Ordered, non-overlapping segments
    pub segments: Vec<Segment>,
    /// Detected or requested language code
    pub language: String,
    pub language_probability: f32,
    /// Total audio duration in seconds
    pub duration: f64,
}

impl Transcript {
    /// Joined text of all segments, whitespace-separated.
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A materialized, inference-capable model resource.
///
/// Implementations own whatever device memory the model occupies; dropping
/// the last reference releases it.
pub trait SpeechEngine: Send + Sync {
    /// Transcribe 16 kHz mono f32 samples into timed segments.
    ///
    /// Blocking and potentially long-running; callers on an async runtime
    /// must move this onto a blocking thread.
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> anyhow::Result<Transcript>;
}

/// Materializes model resources on demand.
///
/// The single call the lifecycle manager makes into the inference stack.
/// Blocking; may take seconds to tens of seconds for large models.
pub trait EngineFactory: Send + Sync {
    fn materialize(
        &self,
        model: &str,
        device: DeviceKind,
        compute: ComputeType,
    ) -> anyhow::Result<Arc<dyn SpeechEngine>>;

    /// Force a device-memory reclamation pass after a resident model has been
    /// dropped. For accelerator devices this synchronizes outstanding work so
    /// freed allocations are actually returned before the next load.
    fn reclaim(&self, device: DeviceKind);
}
