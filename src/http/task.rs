//! Parent request task.
//!
//! # Responsibilities
//! - Run the handler against the request/response pair
//! - Drive attached child operations to completion, in attachment order
//! - Hand the finished response to the transport
//! - Fire finish hooks exactly once, after the transport is done with the body
//!
//! # Lifecycle
//! ```text
//! ServerTask::process
//!     → handler(req, resp)              (may attach children)
//!     → for each child: await → completion(resp)
//!     → Reply
//!         → into_response()             (body streamed by hyper)
//!             → end of body / drop      → finish hooks(TaskReport)
//!         → finish(state, error)        (transport handled elsewhere)
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use http_body::{Frame, SizeHint};

use crate::codec::Compress;
use crate::http::{HttpReq, HttpResp};
use crate::subtask::{errno, Services, TaskState};

/// Header carrying the request correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Outcome of the parent task's own reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub state: TaskState,
    pub error: i32,
    /// Output body size in bytes.
    pub body_size: usize,
    pub request_id: String,
}

/// Callback run once the parent's reply is finished.
pub type FinishHook = Box<dyn FnOnce(&TaskReport) + Send>;

/// Hooks waiting for the reply to finish.
///
/// Fired at most once. Dropping unfired hooks runs them with a failure
/// report, so a reply that never reaches the transport still releases
/// whatever its hooks own.
pub(crate) struct FinishHooks {
    hooks: Vec<FinishHook>,
    body_size: usize,
    request_id: String,
}

impl FinishHooks {
    fn new(hooks: Vec<FinishHook>, body_size: usize, request_id: String) -> Self {
        Self {
            hooks,
            body_size,
            request_id,
        }
    }

    fn fire(mut self, state: TaskState, error: i32) {
        self.run(state, error);
    }

    fn run(&mut self, state: TaskState, error: i32) {
        let hooks = std::mem::take(&mut self.hooks);
        if hooks.is_empty() {
            return;
        }
        let report = TaskReport {
            state,
            error,
            body_size: self.body_size,
            request_id: std::mem::take(&mut self.request_id),
        };
        for hook in hooks {
            hook(&report);
        }
    }
}

impl Drop for FinishHooks {
    fn drop(&mut self) {
        self.run(TaskState::SysError, errno::EPIPE);
    }
}

/// One in-flight request: the handler's request/response pair.
pub struct ServerTask {
    req: HttpReq,
    resp: HttpResp,
    request_id: String,
}

impl ServerTask {
    pub fn new(req: HttpReq, services: Arc<Services>) -> Self {
        let request_id = req
            .header(X_REQUEST_ID)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            req,
            resp: HttpResp::new(services),
            request_id,
        }
    }

    /// Pre-set the response `Content-Encoding` before the handler runs.
    pub fn with_default_encoding(mut self, encoding: Option<Compress>) -> Self {
        if let Some(encoding) = encoding {
            self.resp.set_compress(encoding);
        }
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Run `handler`, then every child operation it attached.
    ///
    /// Completions may attach further children; those run too before the
    /// reply is produced.
    pub async fn process<H>(mut self, handler: H) -> Reply
    where
        H: FnOnce(&mut HttpReq, &mut HttpResp) + Send,
    {
        handler(&mut self.req, &mut self.resp);

        let mut children = 0usize;
        while let Some(subtask) = self.resp.next_subtask() {
            let complete = subtask.await;
            complete(&mut self.resp);
            children += 1;
        }

        tracing::debug!(
            request_id = %self.request_id,
            children,
            status = %self.resp.status(),
            "Request processed"
        );
        Reply::new(self.resp, self.request_id)
    }
}

/// A finished response waiting to be written.
pub struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    hooks: FinishHooks,
}

impl Reply {
    fn new(resp: HttpResp, request_id: String) -> Self {
        let (status, mut headers, chunks, hooks) = resp.into_parts();
        let body_size = chunks.iter().map(Bytes::len).sum();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        Self {
            status,
            headers,
            chunks,
            hooks: FinishHooks::new(hooks, body_size, request_id),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_size(&self) -> usize {
        self.hooks.body_size
    }

    /// The body as one contiguous buffer.
    pub fn body(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.body_size());
                for chunk in many {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Report the transport's write outcome and fire the finish hooks.
    pub fn finish(self, state: TaskState, error: i32) {
        self.hooks.fire(state, error);
    }

    /// Convert into an axum response whose body fires the finish hooks.
    pub fn into_response(self) -> Response {
        let remaining = self.hooks.body_size as u64;
        let body = TrackedBody {
            chunks: self.chunks.into(),
            remaining,
            hooks: Some(self.hooks),
        };
        let mut response = Response::new(Body::new(body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Response body that reports when the transport has taken all of it.
struct TrackedBody {
    chunks: VecDeque<Bytes>,
    remaining: u64,
    hooks: Option<FinishHooks>,
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(chunk) = this.chunks.pop_front() {
            this.remaining -= chunk.len() as u64;
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        if let Some(hooks) = this.hooks.take() {
            hooks.fire(TaskState::Success, 0);
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        // Stay open until polled past the last chunk so the hooks fire.
        self.hooks.is_none() && self.chunks.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        let Some(hooks) = self.hooks.take() else {
            return;
        };
        if self.chunks.is_empty() {
            hooks.fire(TaskState::Success, 0);
        } else {
            hooks.fire(TaskState::SysError, errno::ECONNRESET);
        }
    }
}
