//! Request handling.
//!
//! # Responsibilities
//! - Hold the inbound request line, headers and raw transport body
//! - Classify the content type once, at construction
//! - Decode the body lazily (chunked framing, then content-encoding)
//! - Parse the structured views lazily: URL-encoded map, multipart form, JSON
//! - Expose route parameters, query parameters and cookies
//!
//! # Design Decisions
//! - Every lazy field is a `OnceLock`: unset and computed-but-empty differ
//! - Only the view matching the content type is ever computed
//! - Decode and parse failures degrade to the fallback value, never a fault

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::http::{header, request, HeaderMap, Method, Uri, Version};
use bytes::Bytes;
use serde_json::Value;
use url::form_urlencoded;

use crate::codec::{self, chunked, Compress};
use crate::http::content_type::{self, ContentType};
use crate::http::form::{self, Form, FormKv};
use crate::observability::metrics;

static EMPTY_KV: FormKv = BTreeMap::new();
static EMPTY_FORM: Form = BTreeMap::new();
static NULL_JSON: Value = Value::Null;

/// Body bytes as delivered by the transport.
#[derive(Debug, Clone, Default)]
pub struct RawBody {
    bytes: Bytes,
    chunked: bool,
}

impl RawBody {
    /// A body whose transfer framing was already removed.
    pub fn plain(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            chunked: false,
        }
    }

    /// A body still carrying chunked transfer framing.
    pub fn chunked(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            chunked: true,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Body with transfer framing removed; framing errors keep the raw bytes.
    pub fn dechunked(&self) -> Bytes {
        if !self.chunked {
            return self.bytes.clone();
        }
        match chunked::decode(&self.bytes) {
            Ok(decoded) => Bytes::from(decoded),
            Err(e) => {
                tracing::debug!(error = %e, "Chunked framing invalid, using raw body");
                self.bytes.clone()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Payload {
    body: OnceLock<Bytes>,
    form_kv: OnceLock<FormKv>,
    form: OnceLock<Form>,
    json: OnceLock<Value>,
}

/// An inbound HTTP request.
#[derive(Debug)]
pub struct HttpReq {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    raw_body: RawBody,
    content_type: ContentType,
    boundary: Option<String>,
    route_params: HashMap<String, String>,
    query_params: HashMap<String, String>,
    cookies: OnceLock<HashMap<String, String>>,
    payload: Payload,
    #[cfg(test)]
    parse_runs: AtomicUsize,
}

impl HttpReq {
    /// Build a request, classifying its content type.
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap, body: RawBody) -> Self {
        let (content_type, boundary) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(content_type::classify)
            .unwrap_or_default();
        let query_params = parse_query(&uri);

        Self {
            method,
            uri,
            version,
            headers,
            raw_body: body,
            content_type,
            boundary,
            route_params: HashMap::new(),
            query_params,
            cookies: OnceLock::new(),
            payload: Payload::default(),
            #[cfg(test)]
            parse_runs: AtomicUsize::new(0),
        }
    }

    /// Build from request parts whose body was collected by the transport.
    pub fn from_parts(parts: request::Parts, body: Bytes) -> Self {
        Self::new(parts.method, parts.uri, parts.version, parts.headers, RawBody::plain(body))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Whether the client asked to keep the connection open.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.header(header::CONNECTION.as_str()).map(|v| v.to_ascii_lowercase());
        match self.version {
            Version::HTTP_09 | Version::HTTP_10 => {
                connection.is_some_and(|v| v.contains("keep-alive"))
            }
            _ => !connection.is_some_and(|v| v.contains("close")),
        }
    }

    /// The decoded body.
    ///
    /// Chunked framing is removed, then a gzip, deflate or brotli
    /// content-encoding is undone. A failed decompression yields the
    /// chunk-decoded bytes. Computed once.
    pub fn body(&self) -> &Bytes {
        self.payload.body.get_or_init(|| {
            self.count_parse();
            self.decode_body()
        })
    }

    fn decode_body(&self) -> Bytes {
        let content = self.raw_body.dechunked();
        let Some(algorithm) = self
            .header(header::CONTENT_ENCODING.as_str())
            .and_then(Compress::from_header)
        else {
            return content;
        };

        match codec::decompress(&content, algorithm) {
            Ok(decoded) => {
                metrics::record_body_decode(algorithm.as_str(), true);
                Bytes::from(decoded)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Request body decompression failed, using raw body");
                metrics::record_body_decode(algorithm.as_str(), false);
                content
            }
        }
    }

    /// URL-encoded view; empty unless the content type is URL-encoded.
    pub fn form_kv(&self) -> &FormKv {
        if self.content_type != ContentType::UrlEncoded {
            return &EMPTY_KV;
        }
        self.payload.form_kv.get_or_init(|| {
            self.count_parse();
            form::parse_urlencoded(self.body())
        })
    }

    pub fn has_form_kv(&self) -> bool {
        !self.form_kv().is_empty()
    }

    /// Multipart view; empty unless the content type is multipart with a boundary.
    pub fn form(&self) -> &Form {
        let Some(boundary) = self.boundary.as_deref() else {
            return &EMPTY_FORM;
        };
        if self.content_type != ContentType::Multipart {
            return &EMPTY_FORM;
        }
        self.payload.form.get_or_init(|| {
            self.count_parse();
            form::parse_multipart(self.body(), boundary)
        })
    }

    pub fn has_form(&self) -> bool {
        !self.form().is_empty()
    }

    /// JSON view; `Null` unless the content type is JSON and the body is valid.
    pub fn json(&self) -> &Value {
        if self.content_type != ContentType::Json {
            return &NULL_JSON;
        }
        self.payload.json.get_or_init(|| {
            self.count_parse();
            match serde_json::from_slice(self.body()) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(error = %e, "Request body is not valid JSON");
                    Value::Null
                }
            }
        })
    }

    pub fn has_json(&self) -> bool {
        !self.json().is_null()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.route_params.get(key).map(String::as_str)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.route_params.contains_key(key)
    }

    /// Install the parameters captured by the router.
    pub fn set_route_params(&mut self, params: HashMap<String, String>) {
        self.route_params = params;
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    pub fn default_query<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.query(key).unwrap_or(default)
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.query_params.contains_key(key)
    }

    pub fn query_list(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Cookies from the `Cookie` header, parsed once.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            self.header(header::COOKIE.as_str())
                .map(parse_cookies)
                .unwrap_or_default()
        })
    }

    pub fn cookie(&self, key: &str) -> Option<&str> {
        self.cookies().get(key).map(String::as_str)
    }

    /// Move the request line, headers and body out for forwarding.
    ///
    /// The request keeps `target` as its URI and is left with no headers and
    /// an empty raw body.
    pub(crate) fn take_for_forward(&mut self, target: Uri) -> (Method, HeaderMap, Bytes) {
        let body = std::mem::take(&mut self.raw_body).dechunked();
        let headers = std::mem::take(&mut self.headers);
        self.uri = target;
        (self.method.clone(), headers, body)
    }

    #[cfg(test)]
    fn count_parse(&self) {
        self.parse_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(not(test))]
    fn count_parse(&self) {}

    #[cfg(test)]
    pub(crate) fn parse_runs(&self) -> usize {
        self.parse_runs.load(Ordering::Relaxed)
    }
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request(content_type: &str, encoding: Option<&str>, body: RawBody) -> HttpReq {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        if let Some(encoding) = encoding {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_str(encoding).unwrap());
        }
        HttpReq::new(
            Method::POST,
            Uri::from_static("/submit?page=2&q=rust+lang"),
            Version::HTTP_11,
            headers,
            body,
        )
    }

    #[test]
    fn test_body_is_decoded_once() {
        let req = request("text/plain", None, RawBody::plain("hello"));
        let first = req.body().clone();
        let second = req.body().clone();
        assert_eq!(first, second);
        assert_eq!(first, Bytes::from_static(b"hello"));
        assert_eq!(req.parse_runs(), 1);
    }

    #[test]
    fn test_chunked_gzip_body_is_restored() {
        let original = b"{\"hello\":\"world\"}";
        let packed = codec::compress(original, Compress::Gzip).unwrap();
        let framed = chunked::encode(&packed, 7);
        let req = request("application/json", Some("gzip"), RawBody::chunked(framed));
        assert_eq!(req.body().as_ref(), original);
        assert_eq!(req.json()["hello"], "world");
    }

    #[test]
    fn test_unsupported_encoding_yields_dechunked_bytes() {
        let packed = codec::compress(b"payload", Compress::Brotli).unwrap();
        let framed = chunked::encode(&packed, 5);
        let req = request("text/plain", Some("zstd"), RawBody::chunked(framed));
        assert_eq!(req.body().as_ref(), packed.as_slice());
    }

    #[test]
    fn test_failed_decompression_falls_back() {
        let req = request("text/plain", Some("br"), RawBody::plain("not brotli at all"));
        assert_eq!(req.body().as_ref(), b"not brotli at all");
    }

    #[test]
    fn test_json_view_and_exclusivity() {
        let req = request("application/json", None, RawBody::plain("{\"a\":1,\"b\":[true]}"));
        assert_eq!(req.json()["a"], 1);
        assert!(req.has_json());
        assert!(req.form_kv().is_empty());
        assert!(req.form().is_empty());
        let again = req.json().clone();
        assert_eq!(&again, req.json());
        // one body decode, one JSON parse
        assert_eq!(req.parse_runs(), 2);
    }

    #[test]
    fn test_invalid_json_is_null_and_cached() {
        let req = request("application/json", None, RawBody::plain("{broken"));
        assert!(req.json().is_null());
        assert!(req.json().is_null());
        assert!(!req.has_json());
        assert_eq!(req.parse_runs(), 2);
    }

    #[test]
    fn test_urlencoded_view_and_exclusivity() {
        let req = request(
            "application/x-www-form-urlencoded",
            None,
            RawBody::plain("user=ferris&bad&lang=rust"),
        );
        assert_eq!(req.form_kv().len(), 2);
        assert_eq!(req.form_kv()["user"], "ferris");
        assert!(req.json().is_null());
        assert!(req.form().is_empty());
        req.form_kv();
        assert_eq!(req.parse_runs(), 2);
    }

    #[test]
    fn test_empty_urlencoded_parse_is_not_repeated() {
        let req = request("application/x-www-form-urlencoded", None, RawBody::plain("&&&"));
        assert!(req.form_kv().is_empty());
        assert!(req.form_kv().is_empty());
        assert_eq!(req.parse_runs(), 2);
    }

    #[test]
    fn test_multipart_view_and_exclusivity() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\r\nabc\r\n--B--\r\n";
        let req = request("multipart/form-data; boundary=\"B\"", None, RawBody::plain(body));
        assert_eq!(req.boundary(), Some("B"));
        assert_eq!(req.form()["f"].content, b"abc");
        assert!(req.form_kv().is_empty());
        assert!(req.json().is_null());
        req.form();
        assert_eq!(req.parse_runs(), 2);
    }

    #[test]
    fn test_multipart_without_boundary_never_parses() {
        let req = request("multipart/form-data", None, RawBody::plain("--B\r\n"));
        assert!(req.form().is_empty());
        assert_eq!(req.parse_runs(), 0);
    }

    #[test]
    fn test_query_params_and_cookies() {
        let mut req = request("text/plain", None, RawBody::default());
        req.headers.insert(header::COOKIE, HeaderValue::from_static("sid=abc; theme=\"dark\""));
        assert_eq!(req.query("page"), Some("2"));
        assert_eq!(req.query("q"), Some("rust lang"));
        assert_eq!(req.default_query("missing", "fallback"), "fallback");
        assert!(req.has_query("page"));
        assert_eq!(req.cookie("sid"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("nope"), None);

        req.set_route_params(HashMap::from([("id".to_string(), "7".to_string())]));
        assert_eq!(req.param("id"), Some("7"));
        assert!(!req.has_param("other"));
    }

    #[test]
    fn test_keep_alive_rules() {
        let mut req = request("text/plain", None, RawBody::default());
        assert!(req.is_keep_alive());
        req.headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!req.is_keep_alive());
        req.version = Version::HTTP_10;
        req.headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(req.is_keep_alive());
        req.headers.remove(header::CONNECTION);
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_take_for_forward_leaves_moved_from_state() {
        let mut req = request("text/plain", None, RawBody::chunked(chunked::encode(b"data", 2)));
        let target: Uri = "http://upstream/x".parse().unwrap();
        let (method, headers, body) = req.take_for_forward(target.clone());
        assert_eq!(method, Method::POST);
        assert!(headers.contains_key(header::CONTENT_TYPE));
        assert_eq!(body.as_ref(), b"data");
        assert!(req.headers().is_empty());
        assert_eq!(req.uri(), &target);
    }
}
