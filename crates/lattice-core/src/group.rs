//! Route groups and the fluent route builder.
//!
//! A group is a prefix plus an inherited middleware slice; nesting
//! concatenates prefixes and appends middleware. Groups exist only while the
//! route table is being built — at request time only the compiled chains
//! remain.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::middleware::{HandlerFunc, Middleware};
use crate::route::RouteMeta;

// =============================================================================
// RouteGroup
// =============================================================================

/// A builder-time grouping of routes under a shared prefix and middleware
/// slice.
#[derive(Clone, Default)]
pub struct RouteGroup {
    prefix: String,
    middlewares: Vec<Middleware>,
}

impl RouteGroup {
    /// Creates a group rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            middlewares: Vec::new(),
        }
    }

    /// Appends a middleware inherited by every route and subgroup.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Creates a nested group; prefixes concatenate and middleware is
    /// inherited by composition of slices.
    pub fn group(&self, prefix: impl AsRef<str>) -> RouteGroup {
        RouteGroup {
            prefix: join_paths(&self.prefix, prefix.as_ref()),
            middlewares: self.middlewares.clone(),
        }
    }

    /// Starts a route builder under this group.
    pub fn route(&self, method: Method, path: impl AsRef<str>) -> RouteBuilder {
        RouteBuilder {
            method,
            path: join_paths(&self.prefix, path.as_ref()),
            name: None,
            meta: RouteMeta::default(),
            middlewares: self.middlewares.clone(),
            handler: None,
            extension: None,
        }
    }

    /// The accumulated prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Joins two path fragments with exactly one slash between them.
fn join_paths(prefix: &str, path: &str) -> String {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        if prefix.is_empty() {
            "/".to_string()
        } else {
            prefix.to_string()
        }
    } else {
        format!("{prefix}/{path}")
    }
}

// =============================================================================
// RouteBuilder
// =============================================================================

/// Fluent builder for one route. Terminal operation is
/// [`register`](RouteBuilder::register) (or [`Router::register_all`]).
///
/// [`Router::register_all`]: crate::router::Router::register_all
#[derive(Clone)]
pub struct RouteBuilder {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) name: Option<String>,
    pub(crate) meta: RouteMeta,
    pub(crate) middlewares: Vec<Middleware>,
    pub(crate) handler: Option<HandlerFunc>,
    pub(crate) extension: Option<Arc<dyn Any + Send + Sync>>,
}

impl RouteBuilder {
    /// Starts a builder outside any group.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            name: None,
            meta: RouteMeta::default(),
            middlewares: Vec::new(),
            handler: None,
            extension: None,
        }
    }

    /// Replaces the path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the documentation summary.
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.meta.summary = Some(summary.into());
        self
    }

    /// Sets the documentation description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = Some(description.into());
        self
    }

    /// Sets the tag list.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Declares the response shape for a status code.
    pub fn response(mut self, status: u16, shape: Value) -> Self {
        self.meta.responses.insert(status, shape);
        self
    }

    /// Replaces the declared response map.
    pub fn responses(mut self, responses: BTreeMap<u16, Value>) -> Self {
        self.meta.responses = responses;
        self
    }

    /// Declares the request-body shape.
    pub fn request_body(mut self, shape: Value) -> Self {
        self.meta.request_body = Some(shape);
        self
    }

    /// Appends a route-local middleware, after any group middleware.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Sets the handler.
    pub fn handler(mut self, handler: HandlerFunc) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Names the route for reverse URL construction. Names are
    /// process-unique per router; duplicates fail at registration.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attaches an opaque payload read back by adapters at dispatch. Used by
    /// the WebSocket layer to carry its endpoint through the route table.
    pub fn extension(mut self, payload: Arc<dyn Any + Send + Sync>) -> Self {
        self.extension = Some(payload);
        self
    }

    /// Registers this route into `router`.
    pub fn register(self, router: &mut crate::router::Router) -> crate::error::RouteResult<()> {
        router.register(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_paths_normalizes_slashes() {
        assert_eq!(join_paths("/api/", "/users"), "/api/users");
        assert_eq!(join_paths("/api", "users"), "/api/users");
        assert_eq!(join_paths("", "/users"), "/users");
        assert_eq!(join_paths("/api", ""), "/api");
        assert_eq!(join_paths("", ""), "/");
    }

    #[test]
    fn nested_group_concatenates_prefix() {
        let api = RouteGroup::new("/api");
        let v1 = api.group("/v1");
        let users = v1.group("users");
        assert_eq!(users.prefix(), "/api/v1/users");
    }
}
