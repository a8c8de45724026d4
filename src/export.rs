//! # Transcript Export
//!
//! Renders transcription segments into downloadable text formats (plain text,
//! SubRip, WebVTT) and derives safe attachment filenames for the download
//! endpoint.

use crate::engine::Segment;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::fmt::Write;

/// Characters kept literal in the RFC 5987 `filename*` parameter.
const RFC5987_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Filename characters that are unsafe on common filesystems.
const UNSAFE_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const MAX_FILENAME_LEN: usize = 150;
const DEFAULT_FILENAME_STEM: &str = "transcription";

/// Export format requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Txt,
    Srt,
    Vtt,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Srt => "application/x-subrip; charset=utf-8",
            ExportFormat::Vtt => "text/vtt; charset=utf-8",
        }
    }
}

/// Format a second offset as `HH:MM:SS` plus milliseconds.
///
/// Milliseconds round half-up; hours are unbounded rather than wrapping.
/// `separator` is `,` for SubRip and `.` for WebVTT and plain text.
pub fn format_timestamp(seconds: f64, separator: char) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    };
    let total_ms = (seconds * 1000.0 + 0.5).floor() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let mins = (total_secs / 60) % 60;
    let hours = total_secs / 3600;
    format!("{:02}:{:02}:{:02}{}{:03}", hours, mins, secs, separator, ms)
}

/// Timestamped plain-text rendering: one `[start --> end] text` line per
/// segment. The untimed variant does not exist here - without timestamps the
/// download uses the submitted full text as-is, which may have been edited by
/// the client since transcription.
pub fn generate_txt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let _ = writeln!(
            out,
            "[{} --> {}] {}",
            format_timestamp(segment.start, '.'),
            format_timestamp(segment.end, '.'),
            text
        );
    }
    out
}

/// SubRip rendering: 1-based cue index, comma millisecond separator, blank
/// line between cues.
pub fn generate_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    let mut index = 1;
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}", index);
        let _ = writeln!(
            out,
            "{} --> {}",
            format_timestamp(segment.start, ','),
            format_timestamp(segment.end, ',')
        );
        let _ = writeln!(out, "{}", text);
        let _ = writeln!(out);
        index += 1;
    }
    out
}

/// WebVTT rendering: `WEBVTT` header, dot millisecond separator, no cue
/// indices.
pub fn generate_vtt(segments: &[Segment]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let _ = writeln!(
            out,
            "{} --> {}",
            format_timestamp(segment.start, '.'),
            format_timestamp(segment.end, '.')
        );
        let _ = writeln!(out, "{}", text);
        let _ = writeln!(out);
    }
    out
}

/// Render a transcript in the requested format. Plain text without
/// timestamps returns `full_text` verbatim - that is the field clients edit
/// before downloading; the segment-based renderings ignore it.
pub fn render(
    format: ExportFormat,
    segments: &[Segment],
    full_text: &str,
    txt_include_timestamps: bool,
) -> String {
    match format {
        ExportFormat::Txt => {
            if txt_include_timestamps {
                generate_txt(segments)
            } else {
                full_text.to_string()
            }
        }
        ExportFormat::Srt => generate_srt(segments),
        ExportFormat::Vtt => generate_vtt(segments),
    }
}

/// Reduce a client-supplied filename stem to something safe for a
/// `Content-Disposition` header and common filesystems.
///
/// Unsafe and control characters are stripped, runs of whitespace collapse to
/// a single space, leading and trailing spaces and dots are trimmed, and the
/// result is capped. A stem that sanitizes to nothing becomes the default.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !UNSAFE_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == ' ' || c == '.');

    let capped: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    let capped = capped.trim_matches(|c: char| c == ' ' || c == '.');

    if capped.is_empty() {
        DEFAULT_FILENAME_STEM.to_string()
    } else {
        capped.to_string()
    }
}

/// Build the `Content-Disposition` value for an attachment, carrying both an
/// ASCII `filename` for old clients and an RFC 5987 `filename*` preserving
/// the full name.
pub fn content_disposition(stem: &str, extension: &str) -> String {
    let full = format!("{}.{}", stem, extension);
    let ascii: String = full
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();
    let encoded = utf8_percent_encode(&full, RFC5987_KEEP);
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii, encoded
    )
}
