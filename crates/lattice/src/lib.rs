//! # Lattice
//!
//! A uniform HTTP routing and WebSocket hub toolkit that lets application
//! code target interchangeable HTTP engines through one adapter-independent
//! API.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐
//! │  Application               │  handlers, middleware, hooks
//! ├────────────────────────────┤
//! │  lattice-core              │  trie router, context, errors, cookies
//! │  lattice-ws                │  upgrade pipeline, pumps, hub, rooms
//! ├─────────────┬──────────────┤
//! │  adapter:   │  adapter:    │  two engines, one contract:
//! │  axum       │  raw hyper   │  identical status/header/cookie output
//! └─────────────┴──────────────┘
//! ```
//!
//! - **Routing**: a path trie with `:param` and `*catchall` segments, route
//!   groups, fluent builders, named routes with reverse lookup, and a
//!   printable inventory.
//! - **Context**: one capability set (headers, cookies, body binding,
//!   JSON/text/file responses, redirects, per-request locals, cancellation)
//!   that both engines fulfill identically.
//! - **WebSockets**: a pre-upgrade hook pipeline, per-connection read/write
//!   pumps with ping/pong keepalive, and a multi-room broadcast hub with
//!   presence tracking and admission control.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lattice::prelude::*;
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     lattice::logging::init();
//!
//!     let mut router = Router::new()
//!         .with_middleware(ErrorHandler::new().into_middleware());
//!     router.get("/hello/:name", handler(|ctx| async move {
//!         let name = ctx.param_or("name", "world");
//!         ctx.json(StatusCode::OK, serde_json::json!({ "hello": name }))
//!     }))?;
//!
//!     let server = AxumServer::new(router);
//!     let handle = server.serve("0.0.0.0:8080").await?;
//!     println!("listening on {}", handle.local_addr());
//!     handle.shutdown_token().cancelled().await;
//!     Ok(())
//! }
//! ```

// Core routing layer
pub use lattice_core::*;

// WebSocket subsystem
pub use lattice_ws;

// Engine adapters
pub use lattice_adapter_axum::AxumServer;
pub use lattice_adapter_hyper::HyperServer;

pub mod logging;

#[cfg(test)]
mod tests;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use lattice::prelude::*;
/// ```
pub mod prelude {
    // Routing
    pub use lattice_core::{
        Context, Cookie, ErrorHandler, HandlerFunc, HttpError, RouteBuilder, RouteGroup, Router,
        SameSite, Server, handler, middleware,
    };

    // WebSockets
    pub use lattice_ws::{
        Hub, RoomConfig, RouterWsExt, SlowClientPolicy, WsConfig, WsContext, ws_handler,
    };

    // Adapters
    pub use lattice_adapter_axum::AxumServer;
    pub use lattice_adapter_hyper::HyperServer;
}
