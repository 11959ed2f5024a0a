//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the demo handlers
//! - Wire up middleware (tracing, request timeout)
//! - Collect the inbound body and hand it to a `ServerTask`
//! - Bind server to listener, shut down gracefully
//! - Observability (metrics, request IDs)

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{RawPathParams, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::http::response::NOT_FOUND_PAGE;
use crate::http::{HttpReq, HttpResp, ServerTask};
use crate::mysql::json::cell_to_json;
use crate::mysql::{CursorStatus, ResultCursor};
use crate::observability::metrics;
use crate::subtask::Services;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub services: Arc<Services>,
}

/// A demo endpoint: fills the response, optionally attaching child operations.
type Handler = fn(&AppState, &mut HttpReq, &mut HttpResp);

/// HTTP server exposing the request/response core.
pub struct HttpServer {
    router: Router,
    config: Arc<ServerConfig>,
}

impl HttpServer {
    /// Create a server whose child operations use real network backends.
    pub fn new(config: ServerConfig) -> Self {
        let services = Arc::new(Services::from_config(&config));
        Self::with_services(config, services)
    }

    /// Create a server with the given child-operation backends.
    pub fn with_services(config: ServerConfig, services: Arc<Services>) -> Self {
        let config = Arc::new(config);
        let state = AppState {
            config: config.clone(),
            services,
        };
        let router = Self::build_router(&config, state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        Router::new()
            .route("/echo", any(echo))
            .route("/form", any(form))
            .route("/json", any(json_echo))
            .route("/upload", any(upload))
            .route("/static/{*path}", get(static_file))
            .route("/proxy/{*path}", any(proxy))
            .route("/mysql", any(mysql))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs))),
            )
    }

    /// Run the server until Ctrl+C.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        self.run_until(listener, shutdown_signal()).await
    }

    /// Run the server until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// The router, for driving requests without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn echo(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_echo).await
}

async fn form(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_form).await
}

async fn json_echo(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_json).await
}

async fn upload(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_upload).await
}

async fn static_file(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_static).await
}

async fn proxy(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_proxy).await
}

async fn mysql(State(state): State<AppState>, params: RawPathParams, request: Request<Body>) -> Response {
    dispatch(state, params, request, handle_mysql).await
}

/// Collect the body, run `handler` and its children, and stream the reply.
async fn dispatch(state: AppState, params: RawPathParams, request: Request<Body>, handler: Handler) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();

    let body = match axum::body::to_bytes(body, state.config.listener.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Request body rejected");
            metrics::record_request(&method, StatusCode::PAYLOAD_TOO_LARGE.as_u16(), start);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let mut req = HttpReq::from_parts(parts, body);
    let route_params: HashMap<String, String> = params
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    req.set_route_params(route_params);

    let task = ServerTask::new(req, state.services.clone())
        .with_default_encoding(state.config.response.default_encoding);
    let request_id = task.request_id().to_string();
    let reply = task.process(|req, resp| handler(&state, req, resp)).await;

    let status = reply.status();
    metrics::record_request(&method, status.as_u16(), start);
    tracing::info!(
        request_id = %request_id,
        method = %method,
        status = status.as_u16(),
        body_size = reply.body_size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    reply.into_response()
}

/// Echo the decoded body back with the request's content type.
fn handle_echo(_state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    if let Some(content_type) = req.header(header::CONTENT_TYPE.as_str()) {
        resp.set_header(header::CONTENT_TYPE, content_type);
    }
    resp.set_body(req.body());
}

/// Describe the parsed form, urlencoded or multipart.
fn handle_form(_state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    if req.has_form_kv() {
        let fields: Map<String, Value> = req
            .form_kv()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        resp.json(&Value::Object(fields));
    } else if req.has_form() {
        let parts: Map<String, Value> = req
            .form()
            .iter()
            .map(|(name, part)| {
                let value = match (&part.filename, part.content_str()) {
                    (None, Some(text)) => Value::String(text.to_string()),
                    _ => json!({
                        "filename": part.filename,
                        "content_type": part.content_type,
                        "size": part.content.len(),
                    }),
                };
                (name.clone(), value)
            })
            .collect();
        resp.json(&Value::Object(parts));
    } else {
        resp.set_status(StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16());
        resp.json(&json!({"errmsg": "expected a form body"}));
    }
}

fn handle_json(_state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    if req.has_json() {
        let doc = req.json().clone();
        resp.json(&doc);
    } else {
        resp.set_status(StatusCode::BAD_REQUEST.as_u16());
        resp.json_str(r#"{"errmsg":"expected a json body"}"#);
    }
}

/// Save every uploaded file part under the upload directory.
fn handle_upload(state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    let dir = &state.config.files.upload_dir;
    let mut saved = 0usize;
    for part in req.form().values() {
        let Some(name) = part.filename.as_deref().and_then(|f| Path::new(f).file_name()) else {
            continue;
        };
        resp.save(dir.join(name), part.content.clone());
        saved += 1;
    }
    if saved == 0 {
        resp.set_status(StatusCode::BAD_REQUEST.as_u16());
        resp.string("no file part in request\n");
    }
}

/// Serve a file from the static root, honoring a single `Range`.
fn handle_static(state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    let relative = req.param("path").unwrap_or_default();
    if !is_contained(relative) {
        resp.set_status(StatusCode::NOT_FOUND.as_u16());
        resp.set_header(header::CONTENT_TYPE, "text/html");
        resp.string(NOT_FOUND_PAGE);
        return;
    }

    let path = state.config.files.root.join(relative);
    match req.header(header::RANGE.as_str()).and_then(parse_range) {
        Some((start, end)) => resp.file_range(path, start, end),
        None => resp.file(path),
    }
}

/// Forward the request to the configured upstream.
fn handle_proxy(state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    let proxy = &state.config.proxy;
    let Some(upstream) = proxy.upstream.as_deref() else {
        resp.set_status(StatusCode::NOT_FOUND.as_u16());
        resp.set_header(header::CONTENT_TYPE, "text/html");
        resp.string(NOT_FOUND_PAGE);
        return;
    };

    let mut url = format!(
        "{}/{}",
        upstream.trim_end_matches('/'),
        req.param("path").unwrap_or_default()
    );
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }
    resp.http(req, &url, proxy.redirect_max, proxy.size_limit);
}

/// Run the `sql` query parameter (or the body) against the configured database.
///
/// `?mode=cursor` renders the raw results as tab-separated text.
fn handle_mysql(state: &AppState, req: &mut HttpReq, resp: &mut HttpResp) {
    let Some(url) = state.config.mysql.url.as_deref() else {
        resp.set_status(StatusCode::SERVICE_UNAVAILABLE.as_u16());
        resp.json(&json!({"error": "database is not configured"}));
        return;
    };

    let sql = match req.query("sql") {
        Some(sql) => sql.to_string(),
        None => String::from_utf8_lossy(req.body()).into_owned(),
    };

    if req.default_query("mode", "json") == "cursor" {
        resp.mysql_cursor(url, &sql, render_cursor);
    } else {
        resp.mysql(url, &sql);
    }
}

fn render_cursor(resp: &mut HttpResp, cursor: &mut ResultCursor<'_>) {
    let mut out = String::new();
    loop {
        let status = cursor.status();
        match status {
            CursorStatus::GetResult => {
                let names: Vec<&str> = cursor.fetch_fields().iter().map(|f| f.name.as_str()).collect();
                out.push_str(&names.join("\t"));
                out.push('\n');
                while let Some(row) = cursor.fetch_row() {
                    let cells: Vec<String> = row.iter().map(cell_text).collect();
                    out.push_str(&cells.join("\t"));
                    out.push('\n');
                }
            }
            CursorStatus::Ok => out.push_str(&format!(
                "OK affected_rows={} insert_id={} warnings={}\n",
                cursor.affected_rows(),
                cursor.insert_id(),
                cursor.warnings()
            )),
            CursorStatus::Error => {
                if let Some(err) = cursor.error() {
                    out.push_str(&format!("ERROR {} {}\n", err.code, err.message));
                }
            }
            CursorStatus::End => {}
        }
        if matches!(status, CursorStatus::Error | CursorStatus::End) {
            break;
        }
        cursor.next_result_set();
    }
    resp.set_header(header::CONTENT_TYPE, "text/plain");
    resp.string(out);
}

fn cell_text(cell: &crate::mysql::Cell) -> String {
    match cell_to_json(cell) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// True if `relative` stays inside the directory it is joined to.
fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Parse `bytes=start-end` (inclusive end) into `(start, exclusive end)`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    if ranges.contains(',') {
        return None;
    }
    let (start, end) = ranges.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().ok()?.saturating_add(1)),
    };
    Some((start, end))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
