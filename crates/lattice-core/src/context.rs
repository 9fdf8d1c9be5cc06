//! The uniform per-request context.
//!
//! [`Context`] is the capability set handlers program against; both engine
//! adapters implement it. Engine-specific code supplies only the request
//! surface (method, path, headers, body bytes) — everything mutable lives in
//! a shared [`RequestScratch`] and every response operation is a default
//! method writing into it, so the two adapters cannot drift apart in
//! response semantics.
//!
//! Generic operations that cannot be object-safe ([`bind`](dyn Context::bind),
//! [`json_of`](dyn Context::json_of), [`redirect_to_route`](dyn Context::redirect_to_route))
//! are inherent methods on `dyn Context`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::cookie::Cookie;
use crate::error::{HandlerResult, HttpError};
use crate::router::Router;

// =============================================================================
// Upgrade data carrier
// =============================================================================

/// Key-value payload produced by a WebSocket pre-upgrade hook.
///
/// Populated before the protocol switch while the full HTTP context is still
/// available; immutable once the upgrade completes (enforced by handing the
/// WebSocket side an `Arc<UpgradeData>`).
#[derive(Debug, Clone, Default)]
pub struct UpgradeData {
    entries: BTreeMap<String, Value>,
}

impl UpgradeData {
    /// Creates an empty carrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the carrier is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Response state
// =============================================================================

/// Body variants a handler can stage.
#[derive(Debug, Clone, Default)]
pub enum ResponseBody {
    /// Nothing staged; the adapter sends an empty body.
    #[default]
    None,
    /// In-memory payload with its content type.
    Bytes {
        /// `Content-Type` to emit.
        content_type: String,
        /// Payload bytes.
        data: Bytes,
    },
    /// A file to stream from disk.
    File(PathBuf),
}

/// Accumulated response, converted to an engine response after the chain
/// returns.
#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    /// Explicit status; `None` means 200 unless an error envelope replaces it.
    pub status: Option<StatusCode>,
    /// Plain headers in insertion order.
    pub headers: Vec<(String, String)>,
    /// Cookies serialized to `Set-Cookie` by the shared serializer.
    pub cookies: Vec<Cookie>,
    /// Staged body.
    pub body: ResponseBody,
}

// =============================================================================
// Request scratch
// =============================================================================

/// The mutable, engine-independent half of a request context.
///
/// Adapters embed one per request and hand it out via
/// [`Context::scratch`]; all locals, route-match data, cancellation and
/// response staging flow through here.
pub struct RequestScratch {
    locals: Mutex<BTreeMap<String, Value>>,
    route_params: Mutex<Vec<(String, String)>>,
    route_name: Mutex<Option<String>>,
    cancellation: Mutex<CancellationToken>,
    upgrade_data: Mutex<Option<UpgradeData>>,
    response: Mutex<ResponseState>,
}

impl RequestScratch {
    /// Creates a scratch bound to the request's cancellation token.
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            locals: Mutex::new(BTreeMap::new()),
            route_params: Mutex::new(Vec::new()),
            route_name: Mutex::new(None),
            cancellation: Mutex::new(cancellation),
            upgrade_data: Mutex::new(None),
            response: Mutex::new(ResponseState::default()),
        }
    }

    /// Records the matched route's parameters and name. Called by the router
    /// during dispatch, before the handler chain runs.
    pub fn set_route_match(&self, params: Vec<(String, String)>, name: Option<String>) {
        *self.route_params.lock() = params;
        *self.route_name.lock() = name;
    }

    /// Stores the pre-upgrade payload (WebSocket routes only).
    pub fn set_upgrade_data(&self, data: UpgradeData) {
        *self.upgrade_data.lock() = Some(data);
    }

    /// Takes a snapshot of the staged response.
    pub fn take_response(&self) -> ResponseState {
        std::mem::take(&mut *self.response.lock())
    }
}

impl Default for RequestScratch {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

// =============================================================================
// View engine seam
// =============================================================================

/// Server-side template renderer collaborator.
///
/// The template language itself is outside this crate; adapters hold an
/// implementation and [`Context::render`] delegates to it.
#[async_trait]
pub trait ViewEngine: Send + Sync {
    /// Renders `view` with `context`, wrapped in `layouts` outermost-last.
    async fn render(
        &self,
        view: &str,
        context: &Value,
        layouts: &[String],
    ) -> Result<String, HttpError>;
}

// =============================================================================
// Context trait
// =============================================================================

/// The uniform per-request capability set.
///
/// Required methods cover the engine-specific request surface; everything
/// else is default-implemented over [`RequestScratch`] so both adapters
/// behave identically.
#[async_trait]
pub trait Context: Send + Sync {
    // -------------------------------------------------------------------------
    // Engine surface (implemented per adapter)
    // -------------------------------------------------------------------------

    /// The request method.
    fn method(&self) -> Method;

    /// The request path, without the query string.
    fn path(&self) -> String;

    /// The raw query string, without the leading `?`.
    fn query_string(&self) -> String;

    /// First value of a request header, case-insensitive.
    fn header(&self, name: &str) -> Option<String>;

    /// All request headers with lowercase names.
    fn headers(&self) -> Vec<(String, String)>;

    /// The request body. Adapters collect it before the chain runs.
    fn body(&self) -> Bytes;

    /// Remote peer address, when the engine exposes it.
    fn remote_addr(&self) -> Option<String>;

    /// The shared mutable state for this request.
    fn scratch(&self) -> &RequestScratch;

    /// The router serving this request, for reverse URL construction.
    fn router(&self) -> Option<Arc<Router>>;

    /// The configured view renderer, if any.
    fn view_engine(&self) -> Option<Arc<dyn ViewEngine>>;

    // -------------------------------------------------------------------------
    // Request helpers (engine-independent)
    // -------------------------------------------------------------------------

    /// Single query value; the last occurrence wins.
    fn query(&self, name: &str) -> Option<String> {
        let mut found = None;
        for (key, value) in self.queries() {
            if key == name {
                found = Some(value);
            }
        }
        found
    }

    /// Single query value with a fallback.
    fn query_or(&self, name: &str, default: &str) -> String {
        self.query(name).unwrap_or_else(|| default.to_string())
    }

    /// All query pairs in wire order.
    fn queries(&self) -> Vec<(String, String)> {
        serde_urlencoded::from_str::<Vec<(String, String)>>(&self.query_string())
            .unwrap_or_default()
    }

    /// A matched path parameter.
    fn param(&self, name: &str) -> Option<String> {
        self.scratch()
            .route_params
            .lock()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    /// A matched path parameter with a fallback.
    fn param_or(&self, name: &str, default: &str) -> String {
        self.param(name).unwrap_or_else(|| default.to_string())
    }

    /// All matched path parameters in pattern order.
    fn route_params(&self) -> Vec<(String, String)> {
        self.scratch().route_params.lock().clone()
    }

    /// Name of the matched route, if it was registered with one.
    fn route_name(&self) -> Option<String> {
        self.scratch().route_name.lock().clone()
    }

    /// Value of a request cookie.
    fn cookie_value(&self, name: &str) -> Option<String> {
        let header = self.header("cookie")?;
        for pair in header.split(';') {
            let pair = pair.trim();
            if let Some((key, value)) = pair.split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// A form field from an URL-encoded body.
    ///
    /// Multipart fields are handled by [`bind`](dyn Context::bind); this
    /// accessor covers the common single-field case.
    fn form_value(&self, name: &str) -> Option<String> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&self.body()).ok()?;
        let mut found = None;
        for (key, value) in pairs {
            if key == name {
                found = Some(value);
            }
        }
        found
    }

    /// Pre-upgrade data stored under `key`; `None` on non-WebSocket routes.
    fn upgrade_data(&self, key: &str) -> Option<Value> {
        self.scratch()
            .upgrade_data
            .lock()
            .as_ref()
            .and_then(|data| data.get(key).cloned())
    }

    // -------------------------------------------------------------------------
    // Per-request scratch storage
    // -------------------------------------------------------------------------

    /// Reads a locals entry.
    fn local(&self, key: &str) -> Option<Value> {
        self.scratch().locals.lock().get(key).cloned()
    }

    /// Writes a locals entry, replacing any previous value.
    fn set_local(&self, key: &str, value: Value) {
        self.scratch().locals.lock().insert(key.to_string(), value);
    }

    /// Merges `map` into the locals entry at `key`.
    ///
    /// Unset keys receive a copy of `map`; an existing object is
    /// shallow-merged with `map`'s keys winning; any other existing value is
    /// overwritten.
    fn merge_locals(&self, key: &str, map: Map<String, Value>) {
        let mut locals = self.scratch().locals.lock();
        match locals.get_mut(key) {
            Some(Value::Object(existing)) => {
                for (k, v) in map {
                    existing.insert(k, v);
                }
            }
            _ => {
                locals.insert(key.to_string(), Value::Object(map));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// The request cancellation token; cancelled when the client disconnects
    /// or the server shuts down.
    fn cancellation(&self) -> CancellationToken {
        self.scratch().cancellation.lock().clone()
    }

    /// Replaces the request cancellation token (scope-propagation
    /// middleware).
    fn set_cancellation(&self, token: CancellationToken) {
        *self.scratch().cancellation.lock() = token;
    }

    // -------------------------------------------------------------------------
    // Response staging
    // -------------------------------------------------------------------------

    /// Sets the response status.
    fn set_status(&self, status: StatusCode) {
        self.scratch().response.lock().status = Some(status);
    }

    /// Appends a response header.
    fn set_header(&self, name: &str, value: &str) {
        self.scratch()
            .response
            .lock()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    /// Queues a cookie for `Set-Cookie` emission.
    fn set_cookie(&self, cookie: Cookie) {
        self.scratch().response.lock().cookies.push(cookie);
    }

    /// Stages a JSON body.
    fn json(&self, status: StatusCode, body: Value) -> HandlerResult {
        let data = serde_json::to_vec(&body)
            .map_err(|e| HttpError::internal_from(e, "response serialization failed"))?;
        let mut response = self.scratch().response.lock();
        response.status = Some(status);
        response.body = ResponseBody::Bytes {
            content_type: "application/json".to_string(),
            data: Bytes::from(data),
        };
        Ok(())
    }

    /// Stages a raw body with an explicit content type.
    fn send(&self, status: StatusCode, content_type: &str, data: Bytes) -> HandlerResult {
        let mut response = self.scratch().response.lock();
        response.status = Some(status);
        response.body = ResponseBody::Bytes {
            content_type: content_type.to_string(),
            data,
        };
        Ok(())
    }

    /// Stages a plain-text body.
    fn send_string(&self, status: StatusCode, text: &str) -> HandlerResult {
        self.send(
            status,
            "text/plain; charset=utf-8",
            Bytes::from(text.to_string()),
        )
    }

    /// Stages a file body; the adapter streams it when committing.
    async fn send_file(&self, path: &Path) -> HandlerResult {
        if !path.is_file() {
            return Err(HttpError::not_found(format!(
                "no such file: {}",
                path.display()
            )));
        }
        let mut response = self.scratch().response.lock();
        response.status = Some(StatusCode::OK);
        response.body = ResponseBody::File(path.to_path_buf());
        Ok(())
    }

    /// Renders a view through the configured [`ViewEngine`].
    async fn render(&self, view: &str, context: Value, layouts: Vec<String>) -> HandlerResult {
        let engine = self
            .view_engine()
            .ok_or_else(|| HttpError::internal("no view engine configured"))?;
        let html = engine.render(view, &context, &layouts).await?;
        self.send(
            StatusCode::OK,
            "text/html; charset=utf-8",
            Bytes::from(html),
        )
    }

    /// Stages a redirect.
    fn redirect(&self, location: &str, status: StatusCode) -> HandlerResult {
        let mut response = self.scratch().response.lock();
        response.status = Some(status);
        response
            .headers
            .push(("location".to_string(), location.to_string()));
        Ok(())
    }

    /// Redirects to the `Referer`, or `fallback` when absent.
    fn redirect_back(&self, fallback: &str, status: StatusCode) -> HandlerResult {
        let target = self
            .header("referer")
            .unwrap_or_else(|| fallback.to_string());
        self.redirect(&target, status)
    }
}

// =============================================================================
// Generic operations on dyn Context
// =============================================================================

impl dyn Context {
    /// Decodes the request body into `T` according to `Content-Type`.
    ///
    /// `application/json` decodes as JSON; `application/x-www-form-urlencoded`
    /// and `multipart/form-data` map fields by struct tag; anything else —
    /// including a missing content type — fails with 400
    /// `UNSUPPORTED_MEDIA_TYPE`. A malformed body fails with 400 and the
    /// decode error in metadata.
    pub async fn bind<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let content_type = self.header("content-type").unwrap_or_default();
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        let decode_err = |e: String| {
            HttpError::bad_request("request body could not be decoded")
                .with_metadata_entry("decode_error", Value::String(e))
        };

        match mime.as_str() {
            "application/json" => {
                serde_json::from_slice(&self.body()).map_err(|e| decode_err(e.to_string()))
            }
            "application/x-www-form-urlencoded" => {
                serde_urlencoded::from_bytes(&self.body()).map_err(|e| decode_err(e.to_string()))
            }
            "multipart/form-data" => {
                let fields = read_multipart_fields(&content_type, self.body()).await?;
                let encoded = serde_urlencoded::to_string(&fields)
                    .map_err(|e| decode_err(e.to_string()))?;
                serde_urlencoded::from_str(&encoded).map_err(|e| decode_err(e.to_string()))
            }
            _ => Err(HttpError::bad_request(format!(
                "cannot bind request body with content type '{content_type}'"
            ))
            .with_text_code("UNSUPPORTED_MEDIA_TYPE")),
        }
    }

    /// Serializes `payload` and stages it as a JSON body.
    pub fn json_of<T: Serialize>(&self, status: StatusCode, payload: &T) -> HandlerResult {
        let value = serde_json::to_value(payload)
            .map_err(|e| HttpError::internal_from(e, "response serialization failed"))?;
        self.json(status, value)
    }

    /// Redirects to a named route, filling its parameters.
    pub fn redirect_to_route(
        &self,
        name: &str,
        params: &[(&str, &str)],
        status: StatusCode,
    ) -> HandlerResult {
        let router = self
            .router()
            .ok_or_else(|| HttpError::internal("context has no router reference"))?;
        let location = router
            .url_for(name, params)
            .map_err(|e| HttpError::internal(e.to_string()))?;
        self.redirect(&location, status)
    }
}

/// Collects text fields from a multipart body held in memory.
async fn read_multipart_fields(
    content_type: &str,
    body: Bytes,
) -> Result<Vec<(String, String)>, HttpError> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| HttpError::bad_request(format!("invalid multipart boundary: {e}")))?;
    let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| HttpError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let text = field
            .text()
            .await
            .map_err(|e| HttpError::bad_request(format!("malformed multipart field: {e}")))?;
        fields.push((name, text));
    }
    Ok(fields)
}

/// In-memory [`Context`] used by unit tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct FakeContext {
        pub(crate) scratch: RequestScratch,
        pub(crate) method: Method,
        pub(crate) path: String,
        pub(crate) query: String,
        pub(crate) headers: Vec<(String, String)>,
        pub(crate) body: Bytes,
        pub(crate) router: Option<Arc<Router>>,
    }

    impl FakeContext {
        pub(crate) fn new() -> Self {
            Self {
                scratch: RequestScratch::default(),
                method: Method::GET,
                path: "/".into(),
                query: String::new(),
                headers: Vec::new(),
                body: Bytes::new(),
                router: None,
            }
        }

        pub(crate) fn request(method: Method, path: impl Into<String>) -> Self {
            let mut ctx = Self::new();
            ctx.method = method;
            ctx.path = path.into();
            ctx
        }
    }

    #[async_trait]
    impl Context for FakeContext {
        fn method(&self) -> Method {
            self.method.clone()
        }
        fn path(&self) -> String {
            self.path.clone()
        }
        fn query_string(&self) -> String {
            self.query.clone()
        }
        fn header(&self, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        }
        fn headers(&self) -> Vec<(String, String)> {
            self.headers.clone()
        }
        fn body(&self) -> Bytes {
            self.body.clone()
        }
        fn remote_addr(&self) -> Option<String> {
            None
        }
        fn scratch(&self) -> &RequestScratch {
            &self.scratch
        }
        fn router(&self) -> Option<Arc<Router>> {
            self.router.clone()
        }
        fn view_engine(&self) -> Option<Arc<dyn ViewEngine>> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeContext;
    use super::*;
    use serde_json::json;

    #[test]
    fn locals_merge_semantics() {
        let ctx = FakeContext::new();

        // Unset key: assigned a copy of the map.
        let mut first = Map::new();
        first.insert("a".into(), json!(1));
        ctx.merge_locals("bag", first);
        assert_eq!(ctx.local("bag"), Some(json!({"a": 1})));

        // Existing object: shallow merge, incoming keys win.
        let mut second = Map::new();
        second.insert("a".into(), json!(2));
        second.insert("b".into(), json!(3));
        ctx.merge_locals("bag", second);
        assert_eq!(ctx.local("bag"), Some(json!({"a": 2, "b": 3})));

        // Existing non-object: overwritten.
        ctx.set_local("bag", json!("scalar"));
        let mut third = Map::new();
        third.insert("c".into(), json!(4));
        ctx.merge_locals("bag", third);
        assert_eq!(ctx.local("bag"), Some(json!({"c": 4})));
    }

    #[test]
    fn query_last_occurrence_wins() {
        let mut ctx = FakeContext::new();
        ctx.query = "tag=a&tag=b&page=2".into();
        assert_eq!(ctx.query("tag").as_deref(), Some("b"));
        assert_eq!(ctx.query_or("missing", "x"), "x");
        assert_eq!(ctx.queries().len(), 3);
    }

    #[test]
    fn cookie_value_parses_header() {
        let mut ctx = FakeContext::new();
        ctx.headers
            .push(("cookie".into(), "a=1; session=abc123; b=2".into()));
        assert_eq!(ctx.cookie_value("session").as_deref(), Some("abc123"));
        assert_eq!(ctx.cookie_value("missing"), None);
    }

    #[tokio::test]
    async fn bind_json_body() {
        #[derive(serde::Deserialize)]
        struct User {
            name: String,
        }
        let mut ctx = FakeContext::new();
        ctx.headers
            .push(("content-type".into(), "application/json".into()));
        ctx.body = Bytes::from_static(br#"{"name":"Julie Smith"}"#);
        let ctx: &dyn Context = &ctx;
        let user: User = ctx.bind().await.unwrap();
        assert_eq!(user.name, "Julie Smith");
    }

    #[tokio::test]
    async fn bind_form_body() {
        #[derive(serde::Deserialize)]
        struct Login {
            user: String,
            attempts: u32,
        }
        let mut ctx = FakeContext::new();
        ctx.headers.push((
            "content-type".into(),
            "application/x-www-form-urlencoded".into(),
        ));
        ctx.body = Bytes::from_static(b"user=julie&attempts=3");
        let ctx: &dyn Context = &ctx;
        let login: Login = ctx.bind().await.unwrap();
        assert_eq!(login.user, "julie");
        assert_eq!(login.attempts, 3);
    }

    #[tokio::test]
    async fn bind_without_content_type_is_unsupported_media_type() {
        let mut ctx = FakeContext::new();
        ctx.body = Bytes::from_static(b"{}");
        let ctx: &dyn Context = &ctx;
        let err = ctx.bind::<Value>().await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
        assert_eq!(err.text_code(), "UNSUPPORTED_MEDIA_TYPE");
    }

    #[tokio::test]
    async fn bind_malformed_json_carries_decode_error() {
        let mut ctx = FakeContext::new();
        ctx.headers
            .push(("content-type".into(), "application/json".into()));
        ctx.body = Bytes::from_static(b"{not json");
        let ctx: &dyn Context = &ctx;
        let err = ctx.bind::<Value>().await.unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
        assert!(err.metadata().contains_key("decode_error"));
    }

    #[test]
    fn response_staging_accumulates() {
        let ctx = FakeContext::new();
        ctx.set_status(StatusCode::ACCEPTED);
        ctx.set_header("x-request-id", "r-1");
        ctx.set_cookie(Cookie::new("session", "abc"));
        ctx.send_string(StatusCode::CREATED, "done").unwrap();

        let response = ctx.scratch().take_response();
        assert_eq!(response.status, Some(StatusCode::CREATED));
        assert_eq!(response.headers, vec![("x-request-id".into(), "r-1".into())]);
        assert_eq!(response.cookies.len(), 1);
        match response.body {
            ResponseBody::Bytes { content_type, data } => {
                assert_eq!(content_type, "text/plain; charset=utf-8");
                assert_eq!(&data[..], b"done");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
