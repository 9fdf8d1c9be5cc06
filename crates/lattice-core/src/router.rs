//! The router: route table, name index, dispatch, and reverse URL
//! construction.
//!
//! Registration happens single-threaded during setup; once an adapter starts
//! serving, the router is behind an `Arc` and never mutated again, so lookup
//! needs no synchronization.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tracing::debug;

use crate::context::Context;
use crate::error::{HandlerResult, HttpError, RouteError, RouteResult};
use crate::group::{RouteBuilder, RouteGroup};
use crate::middleware::{HandlerFunc, Middleware, chain, handler};
use crate::route::{Route, RouteSummary};
use crate::trie::{Find, RouteId, Trie, normalize_pattern};

/// Characters percent-encoded when substituting parameters into a pattern.
const SEGMENT_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?');

// =============================================================================
// Router
// =============================================================================

/// Adapter-independent route table.
#[derive(Default)]
pub struct Router {
    trie: Trie,
    routes: Vec<Route>,
    names: HashMap<String, RouteId>,
    middlewares: Vec<Middleware>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Appends a global middleware; the first appended runs outermost.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Appends a global middleware in place.
    pub fn use_middleware(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    /// Starts a route group.
    pub fn group(&self, prefix: impl Into<String>) -> RouteGroup {
        RouteGroup::new(prefix)
    }

    /// Registers a built route.
    pub fn register(&mut self, builder: RouteBuilder) -> RouteResult<()> {
        let handler = builder
            .handler
            .ok_or_else(|| RouteError::MissingHandler {
                pattern: builder.path.clone(),
            })?;

        if let Some(name) = &builder.name {
            if self.names.contains_key(name) {
                return Err(RouteError::DuplicateRouteName { name: name.clone() });
            }
        }

        let pattern = normalize_pattern(&builder.path).to_string();
        let compiled = chain("route", &builder.middlewares, handler);
        let id = self.routes.len();
        self.trie.add(builder.method.clone(), &builder.path, id)?;

        debug!(method = %builder.method, pattern = %pattern, "route registered");

        if let Some(name) = &builder.name {
            self.names.insert(name.clone(), id);
        }
        self.routes.push(Route {
            method: builder.method,
            pattern,
            name: builder.name,
            meta: builder.meta,
            handler: compiled,
            extension: builder.extension,
        });
        Ok(())
    }

    /// Registers a batch of built routes, stopping at the first failure.
    pub fn register_all(
        &mut self,
        builders: impl IntoIterator<Item = RouteBuilder>,
    ) -> RouteResult<()> {
        for builder in builders {
            self.register(builder)?;
        }
        Ok(())
    }

    /// Registers `handler` for `GET pattern`.
    pub fn get(&mut self, pattern: &str, handler: HandlerFunc) -> RouteResult<()> {
        self.register(RouteBuilder::new(Method::GET, pattern).handler(handler))
    }

    /// Registers `handler` for `POST pattern`.
    pub fn post(&mut self, pattern: &str, handler: HandlerFunc) -> RouteResult<()> {
        self.register(RouteBuilder::new(Method::POST, pattern).handler(handler))
    }

    /// Registers `handler` for `PUT pattern`.
    pub fn put(&mut self, pattern: &str, handler: HandlerFunc) -> RouteResult<()> {
        self.register(RouteBuilder::new(Method::PUT, pattern).handler(handler))
    }

    /// Registers `handler` for `DELETE pattern`.
    pub fn delete(&mut self, pattern: &str, handler: HandlerFunc) -> RouteResult<()> {
        self.register(RouteBuilder::new(Method::DELETE, pattern).handler(handler))
    }

    /// Registers `handler` for `PATCH pattern`.
    pub fn patch(&mut self, pattern: &str, handler: HandlerFunc) -> RouteResult<()> {
        self.register(RouteBuilder::new(Method::PATCH, pattern).handler(handler))
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Trie lookup for `path` under `method`.
    pub fn find(&self, method: &Method, path: &str) -> Find {
        self.trie.find(method, path)
    }

    /// The route at `id`. Ids come from [`Find::Found`] and are always valid
    /// for the router that produced them.
    pub fn route(&self, id: RouteId) -> &Route {
        &self.routes[id]
    }

    /// The route registered under `name`.
    pub fn route_by_name(&self, name: &str) -> Option<&Route> {
        self.names.get(name).map(|id| &self.routes[*id])
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Full dispatch: lookup, then the global chain around the matched
    /// route's compiled chain (or around the 404/405 error endpoint).
    pub async fn dispatch(&self, ctx: Arc<dyn Context>) -> HandlerResult {
        let method = ctx.method();
        let path = ctx.path();
        match self.find(&method, &path) {
            Find::Found { route, params } => self.dispatch_route(route, params, ctx).await,
            Find::MethodNotAllowed => {
                self.dispatch_error(
                    ctx,
                    HttpError::method_not_allowed(format!("{method} is not allowed for {path}")),
                )
                .await
            }
            Find::NotFound => {
                self.dispatch_error(ctx, HttpError::not_found(format!("no route matches {path}")))
                    .await
            }
        }
    }

    /// Runs the global chain around an already-matched route.
    pub async fn dispatch_route(
        &self,
        id: RouteId,
        params: Vec<(String, String)>,
        ctx: Arc<dyn Context>,
    ) -> HandlerResult {
        let route = &self.routes[id];
        ctx.scratch().set_route_match(params, route.name.clone());
        let entry = chain("global", &self.middlewares, route.handler.clone());
        entry(ctx).await
    }

    /// Runs the global chain around an endpoint that fails with `err`, so
    /// lookup failures flow through the same error pipeline as handler
    /// failures.
    pub async fn dispatch_error(&self, ctx: Arc<dyn Context>, err: HttpError) -> HandlerResult {
        let endpoint = handler(move |_| {
            let err = err.clone();
            async move { Err(err) }
        });
        let entry = chain("global", &self.middlewares, endpoint);
        entry(ctx).await
    }

    // -------------------------------------------------------------------------
    // Reverse lookup and inventory
    // -------------------------------------------------------------------------

    /// Builds the URL for a named route, substituting `params` into the
    /// pattern. Parameter values are percent-encoded; catch-all values are
    /// inserted verbatim.
    pub fn url_for(&self, name: &str, params: &[(&str, &str)]) -> RouteResult<String> {
        let id = self
            .names
            .get(name)
            .ok_or_else(|| RouteError::UnknownRouteName {
                name: name.to_string(),
            })?;
        let pattern = &self.routes[*id].pattern;

        let lookup = |key: &str| -> RouteResult<&str> {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .ok_or_else(|| RouteError::MissingParam {
                    param: key.to_string(),
                    pattern: pattern.clone(),
                })
        };

        if pattern == "/" {
            return Ok("/".to_string());
        }
        let mut url = String::new();
        for segment in pattern.split('/').skip(1) {
            url.push('/');
            if let Some(param) = segment.strip_prefix(':') {
                url.extend(utf8_percent_encode(lookup(param)?, SEGMENT_ENCODE));
            } else if let Some(rest) = segment.strip_prefix('*') {
                url.push_str(lookup(rest)?);
            } else {
                url.push_str(segment);
            }
        }
        Ok(url)
    }

    /// The route inventory, in registration order.
    pub fn routes(&self) -> Vec<RouteSummary> {
        self.routes
            .iter()
            .map(|route| RouteSummary {
                method: route.method.to_string(),
                pattern: route.pattern.clone(),
                name: route.name.clone(),
                summary: route.meta.summary.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Router {
    /// Renders the route inventory as an aligned table.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summaries = self.routes();
        let method_width = summaries
            .iter()
            .map(|s| s.method.len())
            .chain([6])
            .max()
            .unwrap_or(6);
        let pattern_width = summaries
            .iter()
            .map(|s| s.pattern.len())
            .chain([4])
            .max()
            .unwrap_or(4);
        let name_width = summaries
            .iter()
            .map(|s| s.name.as_deref().unwrap_or("-").len())
            .chain([4])
            .max()
            .unwrap_or(4);

        writeln!(
            f,
            "{:method_width$}  {:pattern_width$}  {:name_width$}  SUMMARY",
            "METHOD", "PATH", "NAME",
        )?;
        for s in &summaries {
            writeln!(
                f,
                "{:method_width$}  {:pattern_width$}  {:name_width$}  {}",
                s.method,
                s.pattern,
                s.name.as_deref().unwrap_or("-"),
                s.summary.as_deref().unwrap_or(""),
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}
