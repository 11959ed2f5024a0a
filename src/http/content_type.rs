//! Content-type classification.
//!
//! The request's `Content-Type` is classified once, when the request is
//! built. The classification decides which structured body view may be
//! parsed; the multipart boundary is kept alongside it.

use std::path::Path;

/// Body kinds with a structured view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    UrlEncoded,
    Multipart,
    Json,
    #[default]
    Other,
}

impl ContentType {
    /// Classify a media type (parameters are ignored).
    pub fn from_media_type(value: &str) -> Self {
        let media_type = value.split(';').next().unwrap_or("").trim();
        if media_type.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            ContentType::UrlEncoded
        } else if media_type.eq_ignore_ascii_case("multipart/form-data") {
            ContentType::Multipart
        } else if media_type.eq_ignore_ascii_case("application/json") {
            ContentType::Json
        } else {
            ContentType::Other
        }
    }
}

/// Classify a `Content-Type` header, extracting the boundary for multipart.
///
/// A multipart type without a usable boundary keeps its classification but
/// yields `None`, which disables multipart parsing for the request.
pub fn classify(header: &str) -> (ContentType, Option<String>) {
    let kind = ContentType::from_media_type(header);
    if kind != ContentType::Multipart {
        return (kind, None);
    }
    (kind, extract_boundary(header))
}

fn extract_boundary(header: &str) -> Option<String> {
    let start = header.find("boundary=")? + "boundary=".len();
    let raw = header[start..].split(';').next().unwrap_or("").trim();
    let boundary = raw.trim_matches(|c| c == '"' || c == '\'');
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

/// Guess a MIME type from a file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
