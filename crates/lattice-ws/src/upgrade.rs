//! The pre-upgrade pipeline and WebSocket route registration.
//!
//! A WebSocket route is an ordinary GET route carrying a [`WsEndpoint`] as
//! its opaque extension payload. Adapters spot the endpoint at dispatch,
//! run [`authorize`] while the full HTTP context is still available, perform
//! their engine's handshake, and hand the upgraded transport to
//! [`run_connection`](crate::pump::run_connection).
//!
//! Anything the connection needs during its lifetime must be extracted here:
//! after the protocol switch the engine may reclaim the request surface.

use std::sync::Arc;

use lattice_core::{
    Context, HttpError, RouteBuilder, RouteResult, Router, UpgradeData, handler,
};
use tracing::debug;

use crate::config::{WsConfig, WsHandler};

// =============================================================================
// Endpoint
// =============================================================================

/// A registered WebSocket route: its config and user handler.
pub struct WsEndpoint {
    /// Route configuration and lifecycle hooks.
    pub config: WsConfig,
    /// Handler invoked on the upgraded connection.
    pub handler: WsHandler,
}

// =============================================================================
// Router extension
// =============================================================================

/// Registers WebSocket routes on the core router.
pub trait RouterWsExt {
    /// Registers `handler` for WebSocket upgrades at `path`.
    fn websocket(&mut self, path: &str, config: WsConfig, handler: WsHandler) -> RouteResult<()>;
}

impl RouterWsExt for Router {
    fn websocket(&mut self, path: &str, config: WsConfig, handler: WsHandler) -> RouteResult<()> {
        let endpoint = Arc::new(WsEndpoint { config, handler });
        // The HTTP handler only runs when an adapter fails to intercept the
        // route, i.e. the request is not an upgrade.
        let fallback = handler_not_upgradable();
        self.register(
            RouteBuilder::new(http::Method::GET, path)
                .extension(endpoint)
                .handler(fallback),
        )
    }
}

fn handler_not_upgradable() -> lattice_core::HandlerFunc {
    handler(|_ctx| async {
        Err(HttpError::custom(
            "UPGRADE_REQUIRED",
            426,
            "this endpoint only accepts WebSocket upgrade requests",
        ))
    })
}

// =============================================================================
// Pre-upgrade pipeline
// =============================================================================

/// Whether `origin` passes the configured allow-list. `"*"` disables the
/// check; a missing `Origin` header (non-browser client) is allowed.
pub fn check_origin(origins: &[String], origin: Option<&str>) -> bool {
    if origins.iter().any(|o| o == "*") {
        return true;
    }
    match origin {
        None => true,
        Some(origin) => origins.iter().any(|allowed| allowed == origin),
    }
}

/// Runs the pre-upgrade pipeline: origin validation, then the
/// `on_pre_upgrade` hook with the full HTTP context.
///
/// On success the upgrade data is attached to the HTTP context (so the rest
/// of the chain can read it) and returned for the WebSocket context. An
/// error aborts the upgrade; the adapter renders it as an HTTP error
/// response and no protocol switch happens.
pub async fn authorize(
    endpoint: &WsEndpoint,
    ctx: &Arc<dyn Context>,
) -> Result<Arc<UpgradeData>, HttpError> {
    let origin = ctx.header("origin");
    if !check_origin(&endpoint.config.origins, origin.as_deref()) {
        debug!(origin = origin.as_deref().unwrap_or("-"), "websocket origin rejected");
        return Err(HttpError::forbidden("origin not allowed")
            .with_text_code("ORIGIN_REJECTED"));
    }

    let data = match &endpoint.config.on_pre_upgrade {
        Some(hook) => hook(ctx.clone()).await?,
        None => UpgradeData::new(),
    };
    ctx.scratch().set_upgrade_data(data.clone());
    Ok(Arc::new(data))
}
