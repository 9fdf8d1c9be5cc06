//! # Lattice Core
//!
//! The engine-independent core of the Lattice web toolkit: a path trie with
//! parameter and catch-all matching, route groups and fluent builders, a
//! composable middleware chain, a typed HTTP error surface, and the uniform
//! [`Context`] capability set that every engine adapter fulfills
//! identically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Application code    │  (handlers, middleware)
//! ├──────────────────────┤
//! │  lattice-core        │  <- This crate (router, context, errors)
//! ├──────────────────────┤
//! │  Engine adapters     │  (axum, hyper)
//! ├──────────────────────┤
//! │  Network (TCP/HTTP)  │
//! └──────────────────────┘
//! ```
//!
//! Request flow: engine adapter → trie lookup → global middleware → group
//! and route middleware → handler. Handlers return `Result<(), HttpError>`;
//! a returned error travels back up the chain and the top-level
//! [`ErrorHandler`] middleware renders it as a JSON envelope.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lattice_core::{Router, RouteBuilder, ErrorHandler, handler};
//! use http::{Method, StatusCode};
//!
//! let mut router = Router::new()
//!     .with_middleware(ErrorHandler::new().into_middleware());
//!
//! router.get("/api/users/:id", handler(|ctx| async move {
//!     let id = ctx.param_or("id", "0");
//!     ctx.json(StatusCode::OK, serde_json::json!({ "id": id }))
//! }))?;
//! ```

pub mod context;
pub mod cookie;
pub mod error;
pub mod group;
pub mod middleware;
pub mod respond;
pub mod route;
pub mod router;
pub mod server;
pub mod trie;

pub use context::{
    Context, RequestScratch, ResponseBody, ResponseState, UpgradeData, ViewEngine,
};
pub use cookie::{Cookie, SameSite};
pub use error::{ErrorKind, FieldError, HandlerResult, HttpError, RouteError, RouteResult};
pub use group::{RouteBuilder, RouteGroup};
pub use middleware::{
    ErrorHandler, ErrorMapper, HandlerFunc, HandlerFuture, Middleware, chain, handler, middleware,
};
pub use route::{Route, RouteMeta, RouteSummary};
pub use router::Router;
pub use server::{ServeError, ServeHandle, ServeResult, Server};
pub use trie::{Find, RouteId, Trie};
