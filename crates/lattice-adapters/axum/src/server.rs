//! The axum engine adapter.
//!
//! The whole route table is served by a single axum fallback handler that
//! performs the trie lookup itself, so routing semantics live entirely in
//! `lattice-core` and cannot drift from the other engine. WebSocket routes
//! are intercepted before body collection: the pre-upgrade pipeline runs
//! with the full HTTP context, then the engine performs the handshake and
//! the connection is handed to the engine-independent pumps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router as EngineRouter;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::Method;
use http::request::Parts;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lattice_core::respond::finalize;
use lattice_core::{
    Context, Find, HttpError, Router, ServeError, ServeHandle, ServeResult, Server, ViewEngine,
};
use lattice_ws::{WsEndpoint, authorize, run_connection};

use crate::context::AxumContext;
use crate::websocket::AxumTransport;

/// Largest request body collected into memory.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

struct Shared {
    router: Arc<Router>,
    view_engine: Option<Arc<dyn ViewEngine>>,
    shutdown: CancellationToken,
}

/// The axum-backed engine adapter.
pub struct AxumServer {
    router: Arc<Router>,
    view_engine: Option<Arc<dyn ViewEngine>>,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl AxumServer {
    /// Wraps a finished route table.
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            view_engine: None,
            shutdown: CancellationToken::new(),
            serve_task: Mutex::new(None),
        }
    }

    /// Installs a view renderer for `Context::render`.
    pub fn with_view_engine(mut self, engine: Arc<dyn ViewEngine>) -> Self {
        self.view_engine = Some(engine);
        self
    }

    /// The engine-specific router this adapter serves. Useful for mounting
    /// the adapter inside a larger axum application.
    pub fn engine_router(&self) -> EngineRouter {
        let shared = Arc::new(Shared {
            router: self.router.clone(),
            view_engine: self.view_engine.clone(),
            shutdown: self.shutdown.clone(),
        });
        EngineRouter::new().fallback(dispatch).with_state(shared)
    }
}

#[async_trait]
impl Server for AxumServer {
    fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    async fn serve(&self, addr: &str) -> ServeResult<ServeHandle> {
        if self.serve_task.lock().is_some() {
            return Err(ServeError::AlreadyRunning);
        }
        let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let app = self.engine_router();
        let shutdown = self.shutdown.clone();

        info!(addr = %local_addr, engine = "axum", "server listening");

        let task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                error!(error = %e, "axum serve loop failed");
            }
        });
        *self.serve_task.lock() = Some(task);

        Ok(ServeHandle::new(local_addr, self.shutdown.clone()))
    }

    async fn shutdown(&self, deadline: Duration) -> ServeResult<()> {
        let Some(mut task) = self.serve_task.lock().take() else {
            return Err(ServeError::NotRunning);
        };
        self.shutdown.cancel();
        if tokio::time::timeout(deadline, &mut task).await.is_err() {
            warn!("graceful shutdown deadline elapsed, force-closing");
            task.abort();
        }
        info!(engine = "axum", "server stopped");
        Ok(())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(
    State(shared): State<Arc<Shared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    // WebSocket routes are intercepted before the body is touched; a plain
    // GET without upgrade headers falls through to the route's HTTP
    // handler, like on the other engine.
    if method == Method::GET && is_upgrade_request(&parts) {
        if let Find::Found { route, params } = shared.router.find(&method, &path) {
            let record = shared.router.route(route);
            if let Some(extension) = record.extension() {
                if let Ok(endpoint) = extension.downcast::<WsEndpoint>() {
                    let name = record.name.clone();
                    return upgrade(shared, endpoint, &mut parts, params, name, addr).await;
                }
            }
        }
    }

    let body = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let ctx = make_context(&shared, &parts, Bytes::new(), addr);
            let dyn_ctx: Arc<dyn Context> = ctx.clone();
            let _ = shared
                .router
                .dispatch_error(
                    dyn_ctx,
                    HttpError::bad_request(format!("failed to read request body: {e}")),
                )
                .await;
            return commit(&ctx).await;
        }
    };

    let ctx = make_context(&shared, &parts, body, addr);
    let dyn_ctx: Arc<dyn Context> = ctx.clone();
    if let Err(err) = shared.router.dispatch(dyn_ctx.clone()).await {
        // No error-handler middleware installed; emit the envelope directly.
        let _ = dyn_ctx.json(err.status(), err.to_envelope(None));
    }
    commit(&ctx).await
}

fn make_context(shared: &Arc<Shared>, parts: &Parts, body: Bytes, addr: SocketAddr) -> Arc<AxumContext> {
    Arc::new(AxumContext::new(
        parts,
        body,
        Some(addr.to_string()),
        shared.shutdown.child_token(),
        shared.router.clone(),
        shared.view_engine.clone(),
    ))
}

async fn commit(ctx: &Arc<AxumContext>) -> Response {
    let (parts, bytes) = finalize(ctx.scratch().take_response()).await.into_parts();
    Response::from_parts(parts, Body::from(bytes))
}

fn is_upgrade_request(parts: &Parts) -> bool {
    let contains = |name: http::header::HeaderName, needle: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains(needle))
    };
    contains(http::header::CONNECTION, "upgrade")
        && contains(http::header::UPGRADE, "websocket")
}

async fn upgrade(
    shared: Arc<Shared>,
    endpoint: Arc<WsEndpoint>,
    parts: &mut Parts,
    params: Vec<(String, String)>,
    route_name: Option<String>,
    addr: SocketAddr,
) -> Response {
    let ws = match WebSocketUpgrade::from_request_parts(parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let ctx = make_context(&shared, parts, Bytes::new(), addr);
    ctx.scratch().set_route_match(params, route_name);
    let dyn_ctx: Arc<dyn Context> = ctx.clone();

    let data = match authorize(&endpoint, &dyn_ctx).await {
        Ok(data) => data,
        Err(err) => {
            let _ = shared.router.dispatch_error(dyn_ctx.clone(), err).await;
            return commit(&ctx).await;
        }
    };

    let queries: std::collections::HashMap<String, String> =
        dyn_ctx.queries().into_iter().collect();
    let config = &endpoint.config;
    let mut ws = ws
        .max_message_size(config.max_message_size)
        .write_buffer_size(config.write_buffer_size);
    if !config.subprotocols.is_empty() {
        ws = ws.protocols(config.subprotocols.clone());
    }
    ws.on_upgrade(move |socket| {
        run_connection(Box::new(AxumTransport::new(socket)), endpoint, data, queries)
    })
}
