//! Route records and metadata.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::middleware::HandlerFunc;

// =============================================================================
// Metadata
// =============================================================================

/// Optional documentation metadata attached to a route.
///
/// Consumed by external tooling (API catalogs, schema renderers); the router
/// itself only stores it.
#[derive(Clone, Default)]
pub struct RouteMeta {
    /// One-line summary.
    pub summary: Option<String>,
    /// Longer description.
    pub description: Option<String>,
    /// Grouping tags.
    pub tags: Vec<String>,
    /// Declared response shapes, keyed by status code.
    pub responses: BTreeMap<u16, Value>,
    /// Declared request-body shape.
    pub request_body: Option<Value>,
}

// =============================================================================
// Route
// =============================================================================

/// A registered route: immutable once the server starts accepting traffic.
#[derive(Clone)]
pub struct Route {
    /// HTTP method.
    pub method: Method,
    /// Normalized path pattern.
    pub pattern: String,
    /// Process-unique name for reverse lookup, if registered with one.
    pub name: Option<String>,
    /// Documentation metadata.
    pub meta: RouteMeta,
    /// Compiled handler chain: ancestor-group middleware, then route-local
    /// middleware, then the handler.
    pub(crate) handler: HandlerFunc,
    /// Opaque payload attached by higher layers (the WebSocket subsystem
    /// stores its endpoint here); adapters downcast it at dispatch.
    pub(crate) extension: Option<Arc<dyn Any + Send + Sync>>,
}

impl Route {
    /// The compiled handler chain.
    pub fn handler(&self) -> HandlerFunc {
        self.handler.clone()
    }

    /// The opaque extension payload, if any.
    pub fn extension(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.extension.clone()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("name", &self.name)
            .finish()
    }
}

// =============================================================================
// Summary
// =============================================================================

/// One line of the printable route inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSummary {
    /// HTTP method.
    pub method: String,
    /// Normalized path pattern.
    pub pattern: String,
    /// Route name, when set.
    pub name: Option<String>,
    /// Metadata summary, when set.
    pub summary: Option<String>,
}
