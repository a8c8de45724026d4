//! # Audio Upload Decoding
//!
//! Converts uploaded WAV payloads into the 16 kHz mono f32 sample stream the
//! Whisper engine consumes. Handles stereo downmix and sample-rate conversion.

use anyhow::{anyhow, Result};
use std::io::Cursor;

/// Sample rate Whisper models are trained on.
pub const SAMPLE_RATE: u32 = 16_000;

/// Decode a WAV payload to 16 kHz mono f32 samples in [-1.0, 1.0].
pub fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| anyhow!("Failed to parse WAV data: {}", e))?;

    if header.channel_count == 0 {
        return Err(anyhow!("WAV header declares zero channels"));
    }

    let samples = to_f32_samples(data)?;
    if samples.is_empty() {
        return Err(anyhow!("WAV file contains no audio samples"));
    }

    let mono = downmix(&samples, header.channel_count as usize);
    Ok(resample(&mono, header.sampling_rate, SAMPLE_RATE))
}

/// Convert any supported bit depth to normalized f32.
fn to_f32_samples(data: wav::BitDepth) -> Result<Vec<f32>> {
    let samples = match data {
        wav::BitDepth::Eight(v) => v
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(v) => v.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };
    Ok(samples)
}

/// Average interleaved channels down to mono.
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampling. Sufficient for speech input; anything
/// fancier belongs in the client's export pipeline.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;

        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Vec<u8> {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, channels, sample_rate, 16);
        let mut cursor = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_decode_mono_16k_passthrough() {
        let bytes = wav_bytes(16_000, 1, vec![0, 16384, -16384, 32767]);
        let samples = decode_wav(&bytes).unwrap();
        assert_eq!(samples.len(), 4);
        assert!((samples[1] - 0.5).abs() < 1e-3);
        assert!((samples[2] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stereo_downmix() {
        // L=1.0-ish, R=0.0 should average to ~0.5
        let bytes = wav_bytes(16_000, 2, vec![32767, 0, 32767, 0]);
        let samples = decode_wav(&bytes).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_decode_resamples_to_16k() {
        let input: Vec<i16> = vec![1000; 8_000];
        let bytes = wav_bytes(8_000, 1, input);
        let samples = decode_wav(&bytes).unwrap();
        // 1 second of 8 kHz audio becomes ~1 second of 16 kHz audio
        assert!((samples.len() as i64 - 16_000).abs() < 8);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"definitely not a wav file").is_err());
        assert!(decode_wav(&[]).is_err());
    }
}
