//! The raw-hyper engine adapter.
//!
//! A plain accept loop serves each connection with `http1::Builder`; the
//! service performs the trie lookup and runs the handler chain exactly like
//! the pooled engine does. WebSocket upgrades go through the RFC 6455
//! handshake by hand: the `Sec-WebSocket-Accept` reply is derived while the
//! request surface is still alive, and the upgraded byte stream is wrapped
//! into a tungstenite server-role stream for the engine-independent pumps.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use lattice_core::respond::finalize;
use lattice_core::{
    Context, Find, HttpError, Router, ServeError, ServeHandle, ServeResult, Server, ViewEngine,
};
use lattice_ws::{WsEndpoint, authorize, run_connection};

use crate::context::HyperContext;
use crate::websocket::TungsteniteTransport;

/// Largest request body collected into memory.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

struct Shared {
    router: Arc<Router>,
    view_engine: Option<Arc<dyn ViewEngine>>,
    shutdown: CancellationToken,
}

/// The hyper-backed engine adapter.
pub struct HyperServer {
    router: Arc<Router>,
    view_engine: Option<Arc<dyn ViewEngine>>,
    shutdown: CancellationToken,
    /// Force-close signal for connections that outlive the shutdown
    /// deadline.
    force_close: CancellationToken,
    connections: TaskTracker,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl HyperServer {
    /// Wraps a finished route table.
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            view_engine: None,
            shutdown: CancellationToken::new(),
            force_close: CancellationToken::new(),
            connections: TaskTracker::new(),
            serve_task: Mutex::new(None),
        }
    }

    /// Installs a view renderer for `Context::render`.
    pub fn with_view_engine(mut self, engine: Arc<dyn ViewEngine>) -> Self {
        self.view_engine = Some(engine);
        self
    }
}

#[async_trait]
impl Server for HyperServer {
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
        let shared = Arc::new(Shared {
            router: self.router.clone(),
            view_engine: self.view_engine.clone(),
            shutdown: self.shutdown.clone(),
        });
        let shutdown = self.shutdown.clone();
        let force_close = self.force_close.clone();
        let connections = self.connections.clone();

        info!(addr = %local_addr, engine = "hyper", "server listening");

        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let shared = shared.clone();
                let force_close = force_close.clone();
                connections.spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |request| {
                        handle(shared.clone(), peer, request)
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades();
                    tokio::select! {
                        result = conn => {
                            if let Err(e) = result {
                                debug!(peer = %peer, error = %e, "connection ended with error");
                            }
                        }
                        () = force_close.cancelled() => {
                            debug!(peer = %peer, "connection force-closed");
                        }
                    }
                });
            }
        });
        *self.serve_task.lock() = Some(task);

        Ok(ServeHandle::new(local_addr, self.shutdown.clone()))
    }

    async fn shutdown(&self, deadline: Duration) -> ServeResult<()> {
        let Some(task) = self.serve_task.lock().take() else {
            return Err(ServeError::NotRunning);
        };
        self.shutdown.cancel();
        let _ = task.await;
        self.connections.close();
        if tokio::time::timeout(deadline, self.connections.wait())
            .await
            .is_err()
        {
            warn!("graceful shutdown deadline elapsed, force-closing connections");
            self.force_close.cancel();
            self.connections.wait().await;
        }
        info!(engine = "hyper", "server stopped");
        Ok(())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

async fn handle(
    shared: Arc<Shared>,
    peer: SocketAddr,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (mut parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    // WebSocket routes are intercepted before the body is touched.
    if method == Method::GET && is_upgrade_request(&parts) {
        if let Find::Found { route, params } = shared.router.find(&method, &path) {
            let record = shared.router.route(route);
            if let Some(extension) = record.extension() {
                if let Ok(endpoint) = extension.downcast::<WsEndpoint>() {
                    let name = record.name.clone();
                    return Ok(upgrade(shared, endpoint, &mut parts, params, name, peer).await);
                }
            }
        }
    }

    let body = match Limited::new(body, BODY_LIMIT).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let ctx = make_context(&shared, &parts, Bytes::new(), peer);
            let dyn_ctx: Arc<dyn Context> = ctx.clone();
            let _ = shared
                .router
                .dispatch_error(
                    dyn_ctx,
                    HttpError::bad_request(format!("failed to read request body: {e}")),
                )
                .await;
            return Ok(commit(&ctx).await);
        }
    };

    let ctx = make_context(&shared, &parts, body, peer);
    let dyn_ctx: Arc<dyn Context> = ctx.clone();
    if let Err(err) = shared.router.dispatch(dyn_ctx.clone()).await {
        // No error-handler middleware installed; emit the envelope directly.
        let _ = dyn_ctx.json(err.status(), err.to_envelope(None));
    }
    Ok(commit(&ctx).await)
}

fn make_context(
    shared: &Arc<Shared>,
    parts: &Parts,
    body: Bytes,
    peer: SocketAddr,
) -> Arc<HyperContext> {
    Arc::new(HyperContext::new(
        parts,
        body,
        Some(peer.to_string()),
        shared.shutdown.child_token(),
        shared.router.clone(),
        shared.view_engine.clone(),
    ))
}

async fn commit(ctx: &Arc<HyperContext>) -> Response<Full<Bytes>> {
    let (parts, bytes) = finalize(ctx.scratch().take_response()).await.into_parts();
    Response::from_parts(parts, Full::new(bytes))
}

// =============================================================================
// WebSocket handshake
// =============================================================================

fn header_contains(parts: &Parts, name: http::header::HeaderName, needle: &str) -> bool {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains(needle))
}

fn is_upgrade_request(parts: &Parts) -> bool {
    header_contains(parts, CONNECTION, "upgrade") && header_contains(parts, UPGRADE, "websocket")
}

fn bad_handshake(reason: &str) -> Response<Full<Bytes>> {
    let envelope = HttpError::bad_request(reason).to_envelope(None);
    let mut response = Response::new(Full::new(Bytes::from(envelope.to_string())));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

async fn upgrade(
    shared: Arc<Shared>,
    endpoint: Arc<WsEndpoint>,
    parts: &mut Parts,
    params: Vec<(String, String)>,
    route_name: Option<String>,
    peer: SocketAddr,
) -> Response<Full<Bytes>> {
    let Some(key) = parts.headers.get(SEC_WEBSOCKET_KEY).cloned() else {
        return bad_handshake("missing Sec-WebSocket-Key header");
    };
    let version_ok = parts
        .headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        == Some("13");
    if !version_ok {
        return bad_handshake("unsupported WebSocket version");
    }
    let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
        return bad_handshake("connection is not upgradable");
    };

    let ctx = make_context(&shared, parts, Bytes::new(), peer);
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
    let accept = derive_accept_key(key.as_bytes());
    let config = &endpoint.config;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .write_buffer_size(config.write_buffer_size)
        .read_buffer_size(config.read_buffer_size);
    let handshake_timeout = config.handshake_timeout;

    // First subprotocol offered by both sides wins; none means no
    // Sec-WebSocket-Protocol header in the reply.
    let protocol = parts
        .headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|offered| {
            offered
                .split(',')
                .map(str::trim)
                .find(|p| config.subprotocols.iter().any(|s| s == p))
                .map(str::to_string)
        });

    tokio::spawn(async move {
        match tokio::time::timeout(handshake_timeout, on_upgrade).await {
            Ok(Ok(upgraded)) => {
                let stream = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    Some(ws_config),
                )
                .await;
                run_connection(
                    Box::new(TungsteniteTransport::new(stream)),
                    endpoint,
                    data,
                    queries,
                )
                .await;
            }
            Ok(Err(e)) => warn!(peer = %peer, error = %e, "upgrade failed"),
            Err(_) => warn!(peer = %peer, "handshake deadline elapsed"),
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    match builder.body(Full::default()) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build handshake response");
            bad_handshake("handshake response construction failed")
        }
    }
}
