//! Proxy fetch child operation.
//!
//! # Data Flow
//! ```text
//! HttpResp::http(req, url)
//!     → ProxyCtx allocated (url, keep-alive)
//!     → request line, headers, body moved out of the parent request
//!     → HttpFetcher::fetch (redirects, size limit)
//!     → completion: replace parent response, or 404 page
//!     → finish hook: log a failed reply, release ProxyCtx
//! ```
//!
//! # Design Decisions
//! - The context is owned by exactly one stage at a time; the finish hook
//!   is the last owner, so dropping it is the release
//! - A reset reported by the upstream counts as success
//! - Hop-by-hop headers never cross the proxy in either direction

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use bytes::{Bytes, BytesMut};
use futures_util::future::{BoxFuture, FutureExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::http::response::NOT_FOUND_PAGE;
use crate::http::task::X_REQUEST_ID;
use crate::http::{HttpReq, HttpResp};
use crate::observability::metrics;
use crate::subtask::{classify_error, errno, error_string, is_connection_reset, task_error, TaskState};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Outgoing request handed to a fetcher.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub redirect_max: u32,
    /// Largest response body accepted, in bytes.
    pub size_limit: usize,
}

/// Response received from the upstream.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Terminal state of a fetch, with whatever response was received.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub state: TaskState,
    pub error: i32,
    pub response: Option<FetchedResponse>,
}

impl FetchOutcome {
    pub fn success(response: FetchedResponse) -> Self {
        Self {
            state: TaskState::Success,
            error: 0,
            response: Some(response),
        }
    }

    pub fn failed(state: TaskState, error: i32) -> Self {
        Self {
            state,
            error,
            response: None,
        }
    }
}

/// Performs outbound HTTP fetches for proxy children.
pub trait HttpFetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, FetchOutcome>;
}

/// Fetcher backed by the hyper-util connection-pooling client.
#[derive(Clone)]
pub struct HyperFetcher {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperFetcher {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

impl HttpFetcher for HyperFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, FetchOutcome> {
        let client = self.client.clone();
        async move { execute(client, request).await }.boxed()
    }
}

async fn execute(client: Client<HttpConnector, Full<Bytes>>, request: FetchRequest) -> FetchOutcome {
    let FetchRequest {
        url,
        mut method,
        mut headers,
        mut body,
        redirect_max,
        size_limit,
    } = request;

    let Ok(mut url) = Url::parse(&url) else {
        return FetchOutcome::failed(TaskState::TaskError, task_error::URI_PARSE_FAILED);
    };
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let mut redirects = 0u32;
    loop {
        if url.scheme() != "http" {
            return FetchOutcome::failed(TaskState::TaskError, task_error::URI_SCHEME_INVALID);
        }
        if url.host_str().is_none() {
            return FetchOutcome::failed(TaskState::TaskError, task_error::URI_PARSE_FAILED);
        }
        let Ok(uri) = url.as_str().parse::<Uri>() else {
            return FetchOutcome::failed(TaskState::TaskError, task_error::URI_PARSE_FAILED);
        };

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers.clone());
        }
        let outgoing = match builder.body(Full::new(body.clone())) {
            Ok(r) => r,
            Err(_) => {
                return FetchOutcome::failed(TaskState::TaskError, task_error::URI_PARSE_FAILED)
            }
        };

        tracing::debug!(url = %url, method = %method, redirects, "Fetching upstream");
        let response = match client.request(outgoing).await {
            Ok(r) => r,
            Err(e) => {
                let (state, error) = classify_error(&e);
                tracing::debug!(url = %url, error = %e, "Upstream request failed");
                return FetchOutcome::failed(state, error);
            }
        };

        let status = response.status();
        if is_followed_redirect(status) && redirects < redirect_max {
            if let Some(next) = redirect_target(&url, response.headers()) {
                redirects += 1;
                if status == StatusCode::SEE_OTHER {
                    method = Method::GET;
                    body = Bytes::new();
                    headers.remove(header::CONTENT_TYPE);
                }
                url = next;
                continue;
            }
        }

        return read_body(response, size_limit).await;
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn redirect_target(base: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

async fn read_body(response: hyper::Response<Incoming>, size_limit: usize) -> FetchOutcome {
    let (parts, mut body) = response.into_parts();
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if buf.len() + data.len() > size_limit {
                    tracing::debug!(size_limit, "Upstream body exceeds size limit");
                    return FetchOutcome::failed(TaskState::SysError, errno::EMSGSIZE);
                }
                buf.extend_from_slice(&data);
            }
            Err(e) => {
                let (state, error) = if e.is_incomplete_message() {
                    (TaskState::SysError, errno::ECONNRESET)
                } else {
                    classify_error(&e)
                };
                return FetchOutcome {
                    state,
                    error,
                    response: Some(FetchedResponse {
                        status: parts.status,
                        headers: parts.headers,
                        body: buf.freeze(),
                    }),
                };
            }
        }
    }

    FetchOutcome::success(FetchedResponse {
        status: parts.status,
        headers: parts.headers,
        body: buf.freeze(),
    })
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Where a proxy child is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Initiated,
    Succeeded,
    NetworkError,
    ProtocolError,
}

/// Per-fetch context, owned by the fetch, then the completion, then the
/// parent's finish hook.
#[derive(Debug)]
struct ProxyCtx {
    url: String,
    keep_alive: bool,
    state: ProxyState,
}

impl ProxyCtx {
    fn new(url: &str, keep_alive: bool) -> Self {
        Self {
            url: url.to_string(),
            keep_alive,
            state: ProxyState::Initiated,
        }
    }
}

#[cfg(test)]
impl Drop for ProxyCtx {
    fn drop(&mut self) {
        tests::RELEASED.with(|released| released.set(released.get() + 1));
    }
}

/// Attach a fetch of `url` carrying the parent request.
pub(crate) fn attach(
    resp: &mut HttpResp,
    req: &mut HttpReq,
    url: &str,
    redirect_max: u32,
    size_limit: usize,
) {
    let ctx = ProxyCtx::new(url, req.is_keep_alive());
    let target = url.parse::<Uri>().unwrap_or_else(|_| req.uri().clone());
    let (method, mut headers, body) = req.take_for_forward(target);
    headers.remove(X_REQUEST_ID);

    let fetch = resp.services().fetcher.fetch(FetchRequest {
        url: url.to_string(),
        method,
        headers,
        body,
        redirect_max,
        size_limit,
    });
    resp.run(fetch, move |resp, outcome| complete(resp, ctx, outcome));
}

fn complete(resp: &mut HttpResp, mut ctx: ProxyCtx, outcome: FetchOutcome) {
    let FetchOutcome {
        state,
        error,
        response,
    } = outcome;
    let (state, error) = reclassify(state, error, response.is_some());
    metrics::record_subtask("proxy", state);

    match (state, response) {
        (TaskState::Success, Some(fetched)) => {
            ctx.state = ProxyState::Succeeded;
            let mut headers = fetched.headers;
            strip_hop_by_hop(&mut headers);
            headers.remove(header::CONTENT_LENGTH);
            if !ctx.keep_alive {
                headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
            resp.replace_content(fetched.status, headers, fetched.body);
        }
        (state, _) => {
            ctx.state = match state {
                TaskState::SysError | TaskState::DnsError | TaskState::SslError => {
                    ProxyState::NetworkError
                }
                _ => ProxyState::ProtocolError,
            };
            tracing::error!(
                url = %ctx.url,
                state = %state,
                error,
                reason = %error_string(state, error),
                "Fetch failed"
            );
            let mut headers = resp.headers().clone();
            headers.remove(header::CONTENT_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            resp.replace_content(
                StatusCode::NOT_FOUND,
                headers,
                Bytes::from_static(NOT_FOUND_PAGE.as_bytes()),
            );
        }
    }

    resp.add_callback(move |report| {
        if report.state != TaskState::Success {
            tracing::error!(
                url = %ctx.url,
                proxy_state = ?ctx.state,
                request_id = %report.request_id,
                state = %report.state,
                error = report.error,
                body_length = report.body_size,
                "Reply failed"
            );
        }
        drop(ctx);
    });
}

/// A reset that still delivered a response counts as success.
fn reclassify(state: TaskState, error: i32, has_response: bool) -> (TaskState, i32) {
    if has_response && is_connection_reset(state, error) {
        (TaskState::Success, 0)
    } else {
        (state, error)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::Compress;
    use crate::http::request::RawBody;
    use crate::http::ServerTask;
    use crate::mysql::client::tests::NoDatabase;
    use crate::subtask::Services;
    use axum::http::Version;
    use futures_util::future;
    use http_body_util::BodyExt;
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    thread_local! {
        pub(crate) static RELEASED: Cell<usize> = const { Cell::new(0) };
    }

    /// Fetcher for tasks that never proxy.
    pub(crate) struct NoFetcher;

    impl HttpFetcher for NoFetcher {
        fn fetch(&self, _request: FetchRequest) -> BoxFuture<'static, FetchOutcome> {
            future::ready(FetchOutcome::failed(
                TaskState::TaskError,
                task_error::UPSTREAM_UNAVAILABLE,
            ))
            .boxed()
        }
    }

    /// Fetcher answering with a fixed outcome and recording the request.
    struct Scripted {
        outcome: FetchOutcome,
        seen: Mutex<Vec<FetchRequest>>,
    }

    impl HttpFetcher for Scripted {
        fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, FetchOutcome> {
            self.seen.lock().unwrap().push(request);
            future::ready(self.outcome.clone()).boxed()
        }
    }

    fn upstream_ok(body: &'static str) -> FetchedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        FetchedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn scripted(outcome: FetchOutcome) -> Arc<Scripted> {
        Arc::new(Scripted {
            outcome,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn task_with(fetcher: Arc<Scripted>, version: Version, headers: HeaderMap) -> ServerTask {
        let req = HttpReq::new(
            Method::POST,
            Uri::from_static("/proxy/items"),
            version,
            headers,
            RawBody::plain("payload"),
        );
        let services = Arc::new(Services::new(fetcher, Arc::new(NoDatabase)));
        ServerTask::new(req, services)
    }

    fn released() -> usize {
        RELEASED.with(Cell::get)
    }

    #[tokio::test]
    async fn test_success_replaces_parent_response() {
        let fetcher = scripted(FetchOutcome::success(upstream_ok("from upstream")));
        let mut headers = HeaderMap::new();
        headers.insert("x-client", HeaderValue::from_static("1"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        let reply = task_with(fetcher.clone(), Version::HTTP_11, headers)
            .process(|req, resp| {
                resp.string("discarded");
                resp.http(req, "http://upstream.test/items", 3, usize::MAX);
                assert!(req.headers().is_empty());
            })
            .await;

        assert_eq!(reply.status(), StatusCode::CREATED);
        assert_eq!(reply.header("x-upstream"), Some("yes"));
        assert_eq!(reply.header("transfer-encoding"), None);
        assert_eq!(reply.header("connection"), None);
        assert_eq!(reply.body(), Bytes::from_static(b"from upstream"));

        let seen = fetcher.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].body, Bytes::from_static(b"payload"));
        assert_eq!(seen[0].redirect_max, 3);
        assert!(seen[0].headers.contains_key("x-client"));
    }

    #[tokio::test]
    async fn test_non_keep_alive_parent_forces_close() {
        let fetcher = scripted(FetchOutcome::success(upstream_ok("x")));
        let reply = task_with(fetcher, Version::HTTP_10, HeaderMap::new())
            .process(|req, resp| resp.http(req, "http://upstream.test/", 0, usize::MAX))
            .await;
        assert_eq!(reply.header("connection"), Some("close"));
    }

    #[tokio::test]
    async fn test_reset_counts_as_success() {
        let fetcher = scripted(FetchOutcome {
            state: TaskState::SysError,
            error: errno::ECONNRESET,
            response: Some(upstream_ok("partial")),
        });
        let reply = task_with(fetcher, Version::HTTP_11, HeaderMap::new())
            .process(|req, resp| resp.http(req, "http://upstream.test/", 0, usize::MAX))
            .await;
        assert_eq!(reply.status(), StatusCode::CREATED);
        assert_eq!(reply.body(), Bytes::from_static(b"partial"));
    }

    #[tokio::test]
    async fn test_failure_yields_not_found_page() {
        let fetcher = scripted(FetchOutcome::failed(TaskState::DnsError, crate::subtask::eai::EAI_NONAME));
        let reply = task_with(fetcher, Version::HTTP_11, HeaderMap::new())
            .process(|req, resp| resp.http(req, "http://nowhere.invalid/", 0, usize::MAX))
            .await;
        assert_eq!(reply.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply.body(), Bytes::from_static(NOT_FOUND_PAGE.as_bytes()));
    }

    #[tokio::test]
    async fn test_failure_discards_handler_body_and_encoding() {
        let fetcher = scripted(FetchOutcome::failed(TaskState::SysError, errno::ECONNREFUSED));
        let reply = task_with(fetcher, Version::HTTP_11, HeaderMap::new())
            .with_default_encoding(Some(Compress::Gzip))
            .process(|req, resp| {
                resp.string("handler text");
                resp.http(req, "http://upstream.test/", 0, usize::MAX);
            })
            .await;
        assert_eq!(reply.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply.header("content-encoding"), None);
        assert_eq!(reply.header("content-type"), Some("text/html"));
        assert_eq!(reply.body(), Bytes::from_static(NOT_FOUND_PAGE.as_bytes()));
    }

    #[tokio::test]
    async fn test_reset_without_response_is_a_failure() {
        assert_eq!(
            reclassify(TaskState::SysError, errno::ECONNRESET, false),
            (TaskState::SysError, errno::ECONNRESET)
        );
        assert_eq!(reclassify(TaskState::SysError, errno::ECONNRESET, true), (TaskState::Success, 0));
        assert_eq!(
            reclassify(TaskState::SysError, errno::ECONNREFUSED, true),
            (TaskState::SysError, errno::ECONNREFUSED)
        );

        let fetcher = scripted(FetchOutcome::failed(TaskState::SysError, errno::ECONNRESET));
        let reply = task_with(fetcher, Version::HTTP_11, HeaderMap::new())
            .process(|req, resp| resp.http(req, "http://upstream.test/", 0, usize::MAX))
            .await;
        assert_eq!(reply.status(), StatusCode::NOT_FOUND);
        assert_eq!(reply.body(), Bytes::from_static(NOT_FOUND_PAGE.as_bytes()));
    }

    #[tokio::test]
    async fn test_context_released_exactly_once_across_outcomes() {
        let outcomes = [
            FetchOutcome::success(upstream_ok("ok")),
            FetchOutcome::failed(TaskState::SysError, errno::ECONNREFUSED),
            FetchOutcome::failed(TaskState::SysError, errno::ECONNRESET),
            FetchOutcome::failed(TaskState::DnsError, crate::subtask::eai::EAI_AGAIN),
            FetchOutcome::failed(TaskState::TaskError, task_error::URI_SCHEME_INVALID),
            FetchOutcome::failed(TaskState::SysError, errno::EMSGSIZE),
        ];
        let mut rng = fastrand::Rng::with_seed(7);

        for _ in 0..1000 {
            let before = released();
            let outcome = outcomes[rng.usize(..outcomes.len())].clone();
            let reply = task_with(scripted(outcome), Version::HTTP_11, HeaderMap::new())
                .process(|req, resp| resp.http(req, "http://upstream.test/", 0, usize::MAX))
                .await;
            assert_eq!(released(), before, "released before the parent replied");

            match rng.u8(..3) {
                0 => reply.finish(TaskState::Success, 0),
                1 => reply.finish(TaskState::SysError, errno::EPIPE),
                _ => {
                    let body = reply.into_response().into_body();
                    let _ = body.collect().await;
                }
            }
            assert_eq!(released(), before + 1);
        }
    }

    #[tokio::test]
    async fn test_dropped_reply_still_releases() {
        let before = released();
        let reply = task_with(scripted(FetchOutcome::success(upstream_ok("ok"))), Version::HTTP_11, HeaderMap::new())
            .process(|req, resp| resp.http(req, "http://upstream.test/", 0, usize::MAX))
            .await;
        drop(reply);
        assert_eq!(released(), before + 1);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    fn request(url: &str) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            redirect_max: 0,
            size_limit: usize::MAX,
        }
    }

    #[tokio::test]
    async fn test_hyper_fetcher_rejects_bad_urls() {
        let fetcher = HyperFetcher::new(Duration::from_secs(1));
        let outcome = fetcher.fetch(request("not a url")).await;
        assert_eq!((outcome.state, outcome.error), (TaskState::TaskError, task_error::URI_PARSE_FAILED));
        let outcome = fetcher.fetch(request("https://example.com/")).await;
        assert_eq!((outcome.state, outcome.error), (TaskState::TaskError, task_error::URI_SCHEME_INVALID));
    }

    #[tokio::test]
    async fn test_hyper_fetcher_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = HyperFetcher::new(Duration::from_secs(1));
        let outcome = fetcher.fetch(request(&format!("http://{}/", addr))).await;
        assert_eq!(outcome.state, TaskState::SysError);
        assert!(outcome.response.is_none());
    }
}
