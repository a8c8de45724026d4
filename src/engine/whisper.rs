//! # Candle Whisper Engine
//!
//! Whisper inference behind the [`EngineFactory`]/[`SpeechEngine`] boundary.
//!
//! ## Loading Process:
//! 1. Resolve the model identifier to a HuggingFace repository
//! 2. Download config, tokenizer, and safetensors weights (cached locally)
//! 3. Initialize the model on the chosen device and dtype
//!
//! ## Decoding:
//! Greedy token decoding per 30-second window, with timestamp tokens parsed
//! into segment boundaries. Language is auto-detected on the first window
//! when no hint is given.

use crate::device::{ComputeType, DeviceKind};
use crate::engine::{EngineFactory, Segment, SpeechEngine, Transcript, TranscribeOptions, Word};
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Samples per decoding window (30 s at 16 kHz).
const N_SAMPLES: usize = 30 * 16_000;

/// Seconds represented by one timestamp token step.
const TIMESTAMP_STEP: f64 = 0.02;

/// Maximum tokens decoded per window.
const MAX_DECODE_TOKENS: usize = 224;

/// Peak-amplitude floor below which a window counts as silence.
const VAD_ENERGY_FLOOR: f32 = 1e-3;

/// Languages eligible for auto-detection.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
];

/// Map a public model identifier to its HuggingFace repository.
fn repo_for_model(model: &str) -> Result<String> {
    let repo = match model {
        "tiny" | "tiny.en" | "base" | "base.en" | "small" | "small.en" | "medium"
        | "medium.en" => format!("openai/whisper-{}", model),
        "large-v1" => "openai/whisper-large".to_string(),
        "large-v2" => "openai/whisper-large-v2".to_string(),
        "large-v3" => "openai/whisper-large-v3".to_string(),
        "large-v3-turbo" => "openai/whisper-large-v3-turbo".to_string(),
        "distil-large-v2" => "distil-whisper/distil-large-v2".to_string(),
        "distil-large-v3" => "distil-whisper/distil-large-v3".to_string(),
        other => return Err(anyhow!("Unknown model identifier: {}", other)),
    };
    Ok(repo)
}

/// Factory that materializes candle-backed Whisper engines.
pub struct WhisperEngineFactory;

impl EngineFactory for WhisperEngineFactory {
    fn materialize(
        &self,
        model: &str,
        device: DeviceKind,
        compute: ComputeType,
    ) -> Result<Arc<dyn SpeechEngine>> {
        let engine = WhisperEngine::load(model, device, compute)?;
        Ok(Arc::new(engine))
    }

    fn reclaim(&self, device: DeviceKind) {
        // Candle frees allocations when the model drops; for accelerators we
        // additionally wait for outstanding kernels so the memory is actually
        // back before the next materialization starts.
        if device.is_accelerator() {
            if let Ok(dev) = device.to_candle() {
                if let Err(e) = dev.synchronize() {
                    warn!("Device synchronize during reclaim failed: {}", e);
                }
            }
        }
    }
}

/// Special token ids resolved from the tokenizer vocabulary.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    /// First timestamp token (`<|0.00|>`); ids above encode time offsets
    timestamp_begin: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let get = |name: &str| {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("Tokenizer is missing the {} token", name))
        };
        let no_timestamps = get("<|notimestamps|>")?;
        Ok(Self {
            sot: get("<|startoftranscript|>")?,
            eot: get("<|endoftext|>")?,
            transcribe: get("<|transcribe|>")?,
            no_timestamps,
            timestamp_begin: no_timestamps + 1,
        })
    }
}

/// Model state behind a mutex: the decoder key-value cache makes every
/// forward pass `&mut`, and the service intentionally provides no per-request
/// isolation of engine internals.
struct Inner {
    model: m::model::Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
}

/// A resident Whisper model.
pub struct WhisperEngine {
    inner: Mutex<Inner>,
    device: Device,
    dtype: DType,
    model_id: String,
}

impl WhisperEngine {
    /// Download (cached) and initialize a Whisper model.
    pub fn load(model: &str, device_kind: DeviceKind, compute: ComputeType) -> Result<Self> {
        let repo_name = repo_for_model(model)?;
        info!("Loading Whisper model {} from {}", model, repo_name);
        let start_time = std::time::Instant::now();

        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false)
            .build()?;
        let repo = api.model(repo_name.clone());

        let config_path = repo
            .get("config.json")
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", repo_name, e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", repo_name, e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", repo_name, e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let special = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filter_bank(config.num_mel_bins);

        let device = device_kind.to_candle()?;
        // Candle has no int8 whisper kernels; int8 on CPU runs the f32 path
        // and only half precision changes the weight dtype.
        let dtype = match compute {
            ComputeType::Float16 if device_kind.is_accelerator() => DType::F16,
            _ => DType::F32,
        };

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)? };
        let whisper = m::model::Whisper::load(&vb, config.clone())?;

        info!(
            "Whisper {} loaded on {} ({}) in {:.2}s",
            model,
            device_kind,
            compute,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                model: whisper,
                tokenizer,
                config,
                mel_filters,
                special,
            }),
            device,
            dtype,
            model_id: model.to_string(),
        })
    }

    /// Encode one window into audio features.
    fn encode_window(&self, inner: &mut Inner, chunk: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&inner.config, chunk, &inner.mel_filters);
        let n_mels = inner.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?
            .to_dtype(self.dtype)?;
        let features = inner.model.encoder.forward(&mel, true)?;
        Ok(features)
    }

    /// Detect the spoken language from already-encoded audio features.
    fn detect_language(&self, inner: &mut Inner, features: &Tensor) -> Result<(String, f32)> {
        let lang_ids: Vec<u32> = LANGUAGES
            .iter()
            .filter_map(|code| inner.tokenizer.token_to_id(&format!("<|{}|>", code)))
            .collect();
        if lang_ids.is_empty() {
            // English-only checkpoints carry no language tokens
            return Ok(("en".to_string(), 1.0));
        }

        let sot = Tensor::new(&[[inner.special.sot]], &self.device)?;
        let ys = inner.model.decoder.forward(&sot, features, true)?;
        let logits = inner
            .model
            .decoder
            .final_linear(&ys.i((..1, 0..1))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;

        let ids = Tensor::new(lang_ids.as_slice(), &self.device)?;
        let lang_logits = logits.index_select(&ids, 0)?;
        let probs = softmax(&lang_logits, D::Minus1)?.to_vec1::<f32>()?;

        let (best, prob) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, p)| (LANGUAGES[i], *p))
            .unwrap_or(("en", 0.0));
        debug!("Detected language {} (p={:.3})", best, prob);
        Ok((best.to_string(), prob))
    }

    /// Greedily decode one window into raw token ids.
    fn decode_window(&self, inner: &mut Inner, features: &Tensor, language: &str) -> Result<Vec<u32>> {
        let mut tokens = vec![inner.special.sot];
        if let Some(lang_token) = inner.tokenizer.token_to_id(&format!("<|{}|>", language)) {
            tokens.push(lang_token);
        }
        tokens.push(inner.special.transcribe);
        let prompt_len = tokens.len();

        let mut decoded = Vec::new();
        for i in 0..MAX_DECODE_TOKENS {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = inner.model.decoder.forward(&tokens_t, features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = inner
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;

            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next == inner.special.eot {
                break;
            }
            if next == inner.special.no_timestamps {
                continue;
            }
            if is_repetitive(&decoded, next) {
                debug!("Stopping decode on repetition after {} tokens", decoded.len());
                break;
            }
            tokens.push(next);
            decoded.push(next);

            if tokens.len() - prompt_len >= MAX_DECODE_TOKENS {
                break;
            }
        }
        Ok(decoded)
    }

    /// Split decoded tokens on timestamp tokens into timed segments.
    fn tokens_to_segments(
        &self,
        inner: &Inner,
        decoded: &[u32],
        window_offset: f64,
        window_secs: f64,
    ) -> Result<Vec<Segment>> {
        let ts_begin = inner.special.timestamp_begin;
        let decode_text = |toks: &[u32]| -> Result<String> {
            inner
                .tokenizer
                .decode(toks, true)
                .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
        };

        let mut segments = Vec::new();
        let mut pending: Vec<u32> = Vec::new();
        let mut seg_start: Option<f64> = None;

        for &token in decoded {
            if token >= ts_begin {
                let at = window_offset + (token - ts_begin) as f64 * TIMESTAMP_STEP;
                match seg_start {
                    None => seg_start = Some(at),
                    Some(start) => {
                        let text = decode_text(&pending)?;
                        if !text.trim().is_empty() {
                            segments.push(Segment {
                                start,
                                end: at,
                                text,
                                words: None,
                            });
                        }
                        pending.clear();
                        seg_start = Some(at);
                    }
                }
            } else {
                pending.push(token);
            }
        }

        // Text with no closing timestamp, or a model that emitted none at
        // all, becomes one segment spanning the rest of the window.
        if !pending.is_empty() {
            let text = decode_text(&pending)?;
            if !text.trim().is_empty() {
                segments.push(Segment {
                    start: seg_start.unwrap_or(window_offset),
                    end: window_offset + window_secs,
                    text,
                    words: None,
                });
            }
        }

        Ok(segments)
    }
}

impl SpeechEngine for WhisperEngine {
    fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
        if samples.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let duration = samples.len() as f64 / 16_000.0;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *inner;

        let mut language = options.language.clone();
        let mut language_probability = 1.0f32;
        let mut segments = Vec::new();

        for (idx, chunk) in samples.chunks(N_SAMPLES).enumerate() {
            let window_offset = (idx * N_SAMPLES) as f64 / 16_000.0;
            let window_secs = chunk.len() as f64 / 16_000.0;

            if options.vad_filter
                && chunk.iter().fold(0.0f32, |m, s| m.max(s.abs())) < VAD_ENERGY_FLOOR
            {
                debug!("Skipping silent window at {:.1}s", window_offset);
                continue;
            }

            let features = self.encode_window(inner, chunk)?;

            if language.is_none() {
                let (detected, prob) = self.detect_language(inner, &features)?;
                language = Some(detected);
                language_probability = prob;
            }
            let lang = language.as_deref().unwrap_or("en");

            let decoded = self.decode_window(inner, &features, lang)?;
            let mut window_segments =
                self.tokens_to_segments(inner, &decoded, window_offset, window_secs)?;
            if options.word_timestamps {
                for segment in &mut window_segments {
                    segment.words = Some(interpolate_words(segment));
                }
            }
            segments.extend(window_segments);
        }

        debug!(
            "Transcribed {:.2}s with {}: {} segments",
            duration,
            self.model_id,
            segments.len()
        );

        Ok(Transcript {
            segments,
            language: language.unwrap_or_else(|| "en".to_string()),
            language_probability,
            duration,
        })
    }
}

/// Evenly distribute word timings across a segment. Greedy decoding gives no
/// per-token timing, so this is a linear approximation.
fn interpolate_words(segment: &Segment) -> Vec<Word> {
    let words: Vec<&str> = segment.text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let span = (segment.end - segment.start) / words.len() as f64;
    words
        .iter()
        .enumerate()
        .map(|(i, w)| Word {
            start: segment.start + i as f64 * span,
            end: segment.start + (i + 1) as f64 * span,
            word: (*w).to_string(),
            probability: None,
        })
        .collect()
}

/// Guard against the decoder looping on itself: true when appending `next`
/// would complete a three-token run or repeat the previous trigram.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 2 && tokens[n - 1] == next && tokens[n - 2] == next {
        return true;
    }
    if n >= 5
        && tokens[n - 2] == tokens[n - 5]
        && tokens[n - 1] == tokens[n - 4]
        && next == tokens[n - 3]
    {
        return true;
    }
    false
}

/// Slaney-style mel filter bank for a 400-point FFT at 16 kHz, laid out
/// row-major as (n_mels, n_freqs).
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    const N_FREQS: usize = 201; // n_fft / 2 + 1
    const SAMPLE_RATE: f32 = 16_000.0;

    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let mel_max = hz_to_mel(SAMPLE_RATE / 2.0);
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let freq_step = SAMPLE_RATE / 2.0 / (N_FREQS - 1) as f32;
    let mut filters = vec![0.0f32; n_mels * N_FREQS];

    for mel in 0..n_mels {
        let (lower, center, upper) = (mel_points[mel], mel_points[mel + 1], mel_points[mel + 2]);
        let norm = 2.0 / (upper - lower);
        for freq in 0..N_FREQS {
            let hz = freq as f32 * freq_step;
            let weight = if hz <= center {
                (hz - lower) / (center - lower)
            } else {
                (upper - hz) / (upper - center)
            };
            if weight > 0.0 {
                filters[mel * N_FREQS + freq] = weight * norm;
            }
        }
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_resolution() {
        assert_eq!(repo_for_model("base").unwrap(), "openai/whisper-base");
        assert_eq!(repo_for_model("tiny.en").unwrap(), "openai/whisper-tiny.en");
        assert_eq!(repo_for_model("large-v1").unwrap(), "openai/whisper-large");
        assert_eq!(
            repo_for_model("distil-large-v3").unwrap(),
            "distil-whisper/distil-large-v3"
        );
        assert!(repo_for_model("large-foo").is_err());
        assert!(repo_for_model("").is_err());
    }

    #[test]
    fn test_repetition_guard() {
        // Completing a three-token run
        assert!(is_repetitive(&[5, 9, 9], 9));
        // Completing a repeated trigram
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        // Fresh content is fine
        assert!(!is_repetitive(&[1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80);
        assert_eq!(filters.len(), 80 * 201);
        // Every filter should have at least one positive weight
        for mel in 0..80 {
            let row = &filters[mel * 201..(mel + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "empty filter row {}", mel);
        }
    }

    #[test]
    fn test_word_interpolation_spans_segment() {
        let segment = Segment {
            start: 10.0,
            end: 12.0,
            text: "one two three four".to_string(),
            words: None,
        };
        let words = interpolate_words(&segment);
        assert_eq!(words.len(), 4);
        assert_eq!(words[0].start, 10.0);
        assert!((words[3].end - 12.0).abs() < 1e-9);
        assert_eq!(words[1].word, "two");
    }
}
