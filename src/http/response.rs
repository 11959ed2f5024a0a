//! Response handling.
//!
//! # Responsibilities
//! - Hold status, headers and the output body of the parent task
//! - Apply the negotiated `Content-Encoding` to every body written
//! - Offer JSON, file, multi-file and save variants of the body
//! - Attach child operations (proxy fetch, database query, file I/O)
//! - Register finish hooks that run after the reply is written
//!
//! # Design Decisions
//! - The output body is a list of owned `Bytes` segments; a moved-in body
//!   or a compressed buffer is appended without copying
//! - Each body write appends; a second `string` call extends the body
//! - A failed compression drops the `Content-Encoding` header and writes
//!   the original bytes

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde_json::Value;

use crate::codec::{self, Compress};
use crate::http::file;
use crate::http::task::{FinishHook, TaskReport};
use crate::http::HttpReq;
use crate::mysql::result::ResultCursor;
use crate::subtask::{proxy, query, Completion, Services, SubTask};

/// Body sent when a fetch or file read fails.
pub const NOT_FOUND_PAGE: &str = "<html>404 Not Found.</html>";

/// Body sent when a file save fails.
pub const SERVICE_UNAVAILABLE_PAGE: &str = "<html>503 Service Unavailable.</html>";

/// Body substituted for a JSON string that does not parse.
pub const INVALID_JSON_BODY: &str = r#"{"errmsg":"invalid json syntax"}"#;

const APPLICATION_JSON: &str = "application/json";

/// The response of the parent task.
pub struct HttpResp {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<Bytes>,
    subtasks: VecDeque<SubTask>,
    hooks: Vec<FinishHook>,
    services: Arc<Services>,
}

impl HttpResp {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            subtasks: VecDeque::new(),
            hooks: Vec::new(),
            services,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the status code; codes outside 100..=999 are ignored.
    pub fn set_status(&mut self, code: u16) {
        match StatusCode::from_u16(code) {
            Ok(status) => self.status = status,
            Err(_) => tracing::warn!(code, "Ignoring invalid status code"),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing earlier values.
    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "Ignoring invalid header value"),
        }
    }

    /// Name the content-encoding applied to bodies written from now on.
    pub fn set_compress(&mut self, compress: Compress) {
        self.headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(compress.as_str()));
    }

    fn encoding(&self) -> Option<Compress> {
        self.header(header::CONTENT_ENCODING.as_str())
            .and_then(Compress::from_header)
    }

    fn compress(&mut self, content: &[u8]) -> Option<Vec<u8>> {
        let algorithm = self.encoding()?;
        match codec::compress(content, algorithm) {
            Ok(packed) => Some(packed),
            Err(e) => {
                tracing::warn!(error = %e, "Response compression failed, sending identity body");
                self.headers.remove(header::CONTENT_ENCODING);
                None
            }
        }
    }

    /// Append a borrowed body, copying it unless compression produced a new buffer.
    pub fn set_body(&mut self, content: &[u8]) {
        let chunk = match self.compress(content) {
            Some(packed) => Bytes::from(packed),
            None => Bytes::copy_from_slice(content),
        };
        self.append_output_body(chunk);
    }

    /// Append an owned body, moving it in unless compression produced a new buffer.
    pub fn set_body_owned(&mut self, content: impl Into<Bytes>) {
        let content = content.into();
        let chunk = match self.compress(&content) {
            Some(packed) => Bytes::from(packed),
            None => content,
        };
        self.append_output_body(chunk);
    }

    /// Append a text body.
    pub fn string(&mut self, text: impl AsRef<str>) {
        self.set_body(text.as_ref().as_bytes());
    }

    /// Serialize `value` as the JSON body.
    pub fn json(&mut self, value: &Value) {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        self.set_body_owned(value.to_string());
    }

    /// Use `text` as the JSON body after checking its syntax.
    ///
    /// Invalid JSON is replaced by [`INVALID_JSON_BODY`].
    pub fn json_str(&mut self, text: &str) {
        if !is_valid_json(text) {
            tracing::debug!("Rejecting invalid JSON response body");
            self.json_str(INVALID_JSON_BODY);
            return;
        }
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        self.set_body(text.as_bytes());
    }

    /// Send a whole file as the body.
    pub fn file(&mut self, path: impl Into<PathBuf>) {
        file::send_file(self, path.into(), 0, None);
    }

    /// Send bytes `start..end` of a file (`end` defaults to the file size).
    pub fn file_range(&mut self, path: impl Into<PathBuf>, start: u64, end: Option<u64>) {
        file::send_file(self, path.into(), start, end);
    }

    /// Send several files as one multipart body, in the given order.
    pub fn files(&mut self, paths: Vec<PathBuf>) {
        file::send_files(self, paths);
    }

    /// Write `content` to `dest` and report the outcome as the body.
    pub fn save(&mut self, dest: impl Into<PathBuf>, content: impl Into<Bytes>) {
        file::save_file(self, dest.into(), content.into());
    }

    /// Forward the parent request to `url` and reply with what comes back.
    ///
    /// The request's headers and body are moved into the outgoing fetch.
    pub fn http(&mut self, req: &mut HttpReq, url: &str, redirect_max: u32, size_limit: usize) {
        proxy::attach(self, req, url, redirect_max, size_limit);
    }

    /// Run `sql` and reply with the result document.
    pub fn mysql(&mut self, url: &str, sql: &str) {
        query::attach_json(self, url, sql);
    }

    /// Run `sql` and hand the result document to `func`.
    pub fn mysql_json<F>(&mut self, url: &str, sql: &str, func: F)
    where
        F: FnOnce(&mut HttpResp, Value) + Send + 'static,
    {
        query::attach_json_callback(self, url, sql, func);
    }

    /// Run `sql` and hand a cursor over the raw result to `func`.
    pub fn mysql_cursor<F>(&mut self, url: &str, sql: &str, func: F)
    where
        F: FnOnce(&mut HttpResp, &mut ResultCursor<'_>) + Send + 'static,
    {
        query::attach_cursor(self, url, sql, func);
    }

    /// Attach a child operation.
    ///
    /// `operation` runs after the handler returns; `on_complete` runs once
    /// with its output, before the parent replies.
    pub fn run<T, Op, Done>(&mut self, operation: Op, on_complete: Done)
    where
        T: Send + 'static,
        Op: Future<Output = T> + Send + 'static,
        Done: FnOnce(&mut HttpResp, T) + Send + 'static,
    {
        self.subtasks.push_back(Box::pin(async move {
            let output = operation.await;
            Box::new(move |resp: &mut HttpResp| on_complete(resp, output)) as Completion
        }));
    }

    /// Register a hook that runs after the reply has been written.
    pub fn add_callback<F>(&mut self, hook: F)
    where
        F: FnOnce(&TaskReport) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn output_body_size(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    /// The output body written so far, as one buffer.
    pub fn output_body(&self) -> Bytes {
        match self.body.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => Bytes::from(many.concat()),
        }
    }

    pub(crate) fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Append without applying the content-encoding.
    pub(crate) fn append_output_body(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.body.push(chunk);
        }
    }

    /// Replace status, headers and body wholesale.
    pub(crate) fn replace_content(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        self.status = status;
        self.headers = headers;
        self.body.clear();
        self.append_output_body(body);
    }

    pub(crate) fn next_subtask(&mut self) -> Option<SubTask> {
        self.subtasks.pop_front()
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Vec<Bytes>, Vec<FinishHook>) {
        (self.status, self.headers, self.body, self.hooks)
    }
}

impl std::fmt::Debug for HttpResp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResp")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_size", &self.output_body_size())
            .field("pending_subtasks", &self.subtasks.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Whether `text` is one syntactically valid JSON document.
pub fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
}
