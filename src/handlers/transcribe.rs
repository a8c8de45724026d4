//! # Transcription Handler
//!
//! `POST /transcribe` accepts a multipart upload with an audio file plus
//! query parameters steering the model and decoding options. The model is
//! loaded lazily on first use; transcription itself runs on a blocking thread
//! so the HTTP workers stay responsive.

use crate::engine::{audio, TranscribeOptions, MODEL_CATALOG};
use crate::error::AppError;
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

fn default_beam_size() -> usize {
    5
}

fn default_vad_filter() -> bool {
    true
}

/// Query parameters for `POST /transcribe`.
#[derive(Debug, Deserialize)]
pub struct TranscribeQuery {
    pub model_size: Option<String>,

    /// Language hint; empty or "auto" means detect
    pub language: Option<String>,

    #[serde(default)]
    pub word_timestamps: bool,

    #[serde(default = "default_beam_size")]
    pub beam_size: usize,

    #[serde(default = "default_vad_filter")]
    pub vad_filter: bool,
}

/// The uploaded audio extracted from the multipart payload.
struct Upload {
    bytes: Vec<u8>,
    filename: String,
}

pub async fn transcribe(
    state: web::Data<AppState>,
    query: web::Query<TranscribeQuery>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let start_time = std::time::Instant::now();
    let max_bytes = state.get_config().max_upload_bytes();
    let query = query.into_inner();

    if query.beam_size == 0 {
        return Err(AppError::BadRequest(
            "beam_size must be at least 1".to_string(),
        ));
    }

    let upload = collect_upload(payload, max_bytes).await?;
    if upload.bytes.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }

    let samples = audio::decode_wav(&upload.bytes)
        .map_err(|e| AppError::BadRequest(format!("Could not decode audio: {}", e)))?;

    let requested = query
        .model_size
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());
    if let Some(requested) = requested {
        if !MODEL_CATALOG.contains(&requested) {
            return Err(AppError::BadRequest(format!(
                "Invalid model size: {}. Available: {}",
                requested,
                MODEL_CATALOG.join(", ")
            )));
        }
    }
    let model = state.manager.resolve_model(requested);

    let options = TranscribeOptions {
        language: query
            .language
            .filter(|l| !l.trim().is_empty() && l != "auto"),
        word_timestamps: query.word_timestamps,
        beam_size: query.beam_size,
        vad_filter: query.vad_filter,
    };

    info!(
        filename = %upload.filename,
        model = %model,
        samples = samples.len(),
        "Transcription request"
    );

    let handle = state
        .manager
        .ensure_loaded(&model)
        .await
        .map_err(|e| AppError::ModelLoad(e.to_string()))?;

    let loaded_model = handle.model().to_string();
    let block_options = options.clone();
    let transcript = web::block(move || handle.transcribe(&samples, &block_options))
        .await
        .map_err(|e| AppError::Internal(format!("Transcription task failed: {}", e)))?
        .map_err(|e| AppError::Internal(format!("Transcription failed: {}", e)))?;

    state.manager.record_activity();

    let text = transcript.full_text();
    let total_characters = text.chars().count();
    let characters_per_second = if transcript.duration > 0.0 {
        (total_characters as f64 / transcript.duration * 100.0).round() / 100.0
    } else {
        0.0
    };

    info!(
        filename = %upload.filename,
        model = %loaded_model,
        duration = transcript.duration,
        characters = total_characters,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Transcription completed"
    );

    Ok(HttpResponse::Ok().json(json!({
        "text": text,
        "segments": transcript.segments,
        "language": transcript.language,
        "language_probability": transcript.language_probability,
        "duration": transcript.duration,
        "total_characters": total_characters,
        "characters_per_second": characters_per_second,
        "model_size": loaded_model,
        "options": options
    })))
}

/// Drain the multipart payload, keeping the `file` field and enforcing the
/// upload size cap while streaming. The upload must be an audio or video
/// content type and carry a filename.
async fn collect_upload(mut payload: Multipart, max_bytes: usize) -> Result<Upload, AppError> {
    let mut upload: Option<Upload> = None;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|s| s.to_string());
        if name.as_deref() != Some("file") {
            continue;
        }

        match field.content_type() {
            Some(mime) if mime.type_() == "audio" || mime.type_() == "video" => {}
            _ => {
                return Err(AppError::BadRequest(
                    "Uploaded file is not an audio or video file".to_string(),
                ));
            }
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(|s| s.to_string())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| AppError::BadRequest("Uploaded file has no filename".to_string()))?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("Upload error: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::BadRequest(format!(
                    "File too large (max {} bytes)",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        upload = Some(Upload { bytes, filename });
    }

    upload.ok_or_else(|| AppError::BadRequest("No audio file provided".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_defaults() {
        let query: TranscribeQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(query.model_size.is_none());
        assert!(query.language.is_none());
        assert!(!query.word_timestamps);
        assert_eq!(query.beam_size, 5);
        assert!(query.vad_filter);
    }

    #[test]
    fn test_query_overrides() {
        let query: TranscribeQuery = serde_json::from_value(serde_json::json!({
            "model_size": "small",
            "language": "ko",
            "word_timestamps": true,
            "beam_size": 1,
            "vad_filter": false
        }))
        .unwrap();
        assert_eq!(query.model_size.as_deref(), Some("small"));
        assert_eq!(query.language.as_deref(), Some("ko"));
        assert!(query.word_timestamps);
        assert_eq!(query.beam_size, 1);
        assert!(!query.vad_filter);
    }
}
