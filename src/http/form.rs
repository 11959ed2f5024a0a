//! URL-encoded and multipart form bodies.
//!
//! # Responsibilities
//! - Parse `application/x-www-form-urlencoded` bodies into a key/value map
//! - Parse `multipart/form-data` bodies into named parts
//! - Build multipart bodies for multi-file responses
//!
//! # Design Decisions
//! - Lenient: malformed URL-encoded pairs are skipped
//! - A malformed multipart section ends the parse; earlier parts are kept
//! - Later duplicates of a key replace earlier ones

use std::collections::BTreeMap;

use url::form_urlencoded;

/// Parsed URL-encoded body.
pub type FormKv = BTreeMap<String, String>;

/// Parsed multipart body, keyed by part name.
pub type Form = BTreeMap<String, FormPart>;

/// One named part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormPart {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

impl FormPart {
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Parse a URL-encoded body.
///
/// Pairs without `=` or with an empty key are skipped.
pub fn parse_urlencoded(body: &[u8]) -> FormKv {
    let mut kv = FormKv::new();
    for pair in body.split(|b| *b == b'&') {
        if pair.is_empty() || !pair.contains(&b'=') {
            continue;
        }
        if let Some((key, value)) = form_urlencoded::parse(pair).next() {
            if key.is_empty() {
                continue;
            }
            kv.insert(key.into_owned(), value.into_owned());
        }
    }
    kv
}

/// Parse a multipart body delimited by `boundary`.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Form {
    let mut form = Form::new();
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut close = Vec::with_capacity(delimiter.len() + 2);
    close.extend_from_slice(b"\r\n");
    close.extend_from_slice(delimiter);

    let Some(first) = find_bytes(body, delimiter) else {
        return form;
    };
    let mut pos = first + delimiter.len();

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        // Transport padding after the delimiter is allowed.
        let padding = rest.iter().take_while(|b| **b == b' ' || **b == b'\t').count();
        let rest = &rest[padding..];
        if !rest.starts_with(b"\r\n") {
            tracing::debug!(parsed = form.len(), "multipart: delimiter not followed by CRLF");
            break;
        }
        let headers_start = pos + padding + 2;

        let Some(headers_len) = find_bytes(&body[headers_start..], b"\r\n\r\n") else {
            tracing::debug!(parsed = form.len(), "multipart: unterminated part headers");
            break;
        };
        let headers = String::from_utf8_lossy(&body[headers_start..headers_start + headers_len]);
        let content_start = headers_start + headers_len + 4;

        let Some(content_len) = find_bytes(&body[content_start..], &close) else {
            tracing::debug!(parsed = form.len(), "multipart: part without closing delimiter");
            break;
        };
        let content = &body[content_start..content_start + content_len];

        let Some((name, part)) = parse_part_headers(&headers, content) else {
            tracing::debug!(parsed = form.len(), "multipart: part without a name");
            break;
        };
        form.insert(name, part);

        pos = content_start + content_len + close.len();
    }

    form
}

fn parse_part_headers(headers: &str, content: &[u8]) -> Option<(String, FormPart)> {
    let mut name = None;
    let mut part = FormPart {
        content: content.to_vec(),
        ..Default::default()
    };

    for line in headers.split("\r\n") {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim();
        let value = value.trim();
        if field.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                let Some((key, val)) = param.split_once('=') else {
                    continue;
                };
                let val = val.trim().trim_matches('"').to_string();
                match key.trim().to_ascii_lowercase().as_str() {
                    "name" => name = Some(val),
                    "filename" => part.filename = Some(val),
                    _ => {}
                }
            }
        } else if field.eq_ignore_ascii_case("content-type") {
            part.content_type = Some(value.to_string());
        }
    }

    name.filter(|n| !n.is_empty()).map(|n| (n, part))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Builder for `multipart/form-data` response bodies.
#[derive(Debug)]
pub struct MultipartBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBuilder {
    /// Create a builder with a random boundary.
    pub fn new() -> Self {
        let boundary = format!("splice-{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..));
        Self::with_boundary(boundary)
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            body: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The `Content-Type` header value describing this body.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append a file part.
    pub fn file(mut self, name: &str, filename: &str, content_type: &str, content: &[u8]) -> Self {
        self.body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                name, filename
            )
            .as_bytes(),
        );
        self.body
            .extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Close the body.
    pub fn build(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}
