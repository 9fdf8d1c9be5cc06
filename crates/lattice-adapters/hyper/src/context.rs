//! The [`Context`] implementation over a raw hyper request.
//!
//! Unlike the pooled engine, hyper hands the request over by value and may
//! reclaim it after a protocol upgrade, which is exactly why the
//! pre-upgrade hook exists: everything a WebSocket connection needs is
//! extracted while this context is still alive.

use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method};
use lattice_core::{Context, RequestScratch, Router, ViewEngine};
use tokio_util::sync::CancellationToken;

/// Per-request context backed by hyper.
pub struct HyperContext {
    method: Method,
    path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<String>,
    scratch: RequestScratch,
    router: Arc<Router>,
    view_engine: Option<Arc<dyn ViewEngine>>,
}

impl HyperContext {
    /// Builds a context from request parts and a pre-collected body.
    pub fn new(
        parts: &Parts,
        body: Bytes,
        remote_addr: Option<String>,
        cancellation: CancellationToken,
        router: Arc<Router>,
        view_engine: Option<Arc<dyn ViewEngine>>,
    ) -> Self {
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts.headers.clone(),
            body,
            remote_addr,
            scratch: RequestScratch::new(cancellation),
            router,
            view_engine,
        }
    }
}

impl Context for HyperContext {
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
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }

    fn body(&self) -> Bytes {
        self.body.clone()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn scratch(&self) -> &RequestScratch {
        &self.scratch
    }

    fn router(&self) -> Option<Arc<Router>> {
        Some(self.router.clone())
    }

    fn view_engine(&self) -> Option<Arc<dyn ViewEngine>> {
        self.view_engine.clone()
    }
}
