//! # Transcript Download Handler
//!
//! `POST /download` turns previously returned segments back into a file in
//! the requested format and streams it as an attachment. The client supplies
//! the segments; nothing is re-transcribed.

use crate::engine::Segment;
use crate::error::AppError;
use crate::export::{self, ExportFormat};
use actix_web::{web, HttpResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub segments: Vec<Segment>,

    #[serde(default)]
    pub full_text: String,

    pub file_format: ExportFormat,

    /// Whether plain-text output carries `[start --> end]` prefixes
    #[serde(default)]
    pub txt_include_timestamps: bool,

    /// Stem for the attachment filename, typically the uploaded audio name
    #[serde(default)]
    pub original_filename: Option<String>,
}

pub async fn download(request: web::Json<DownloadRequest>) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();

    let content = export::render(
        request.file_format,
        &request.segments,
        &request.full_text,
        request.txt_include_timestamps,
    );
    if content.trim().is_empty() {
        return Err(AppError::Export(
            "No transcription content to export".to_string(),
        ));
    }

    // Replace the source file's extension with the export format's
    let base_name = request
        .original_filename
        .as_deref()
        .map(strip_extension)
        .unwrap_or("");
    let stem = export::sanitize_filename(base_name);
    let disposition = export::content_disposition(&stem, request.file_format.extension());

    Ok(HttpResponse::Ok()
        .content_type(request.file_format.content_type())
        .insert_header(("Content-Disposition", disposition))
        .body(content))
}

/// Drop the final extension, if any. "my recording.wav" becomes
/// "my recording"; dotfiles and extensionless names pass through.
fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}
