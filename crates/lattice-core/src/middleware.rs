//! Handler and middleware types, chain composition, and the error-handler
//! middleware.
//!
//! A middleware maps a continuation to a new handler
//! (`HandlerFunc -> HandlerFunc`). Chains compose right to left so the
//! first-registered middleware is outermost: it runs first on the way in and
//! last on the way out. Each continuation is guarded so that a buggy
//! middleware invoking it twice gets a defined error instead of corrupting
//! the request.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{HandlerResult, HttpError};

// =============================================================================
// Handler and middleware types
// =============================================================================

/// Boxed future returned by handlers.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A request handler: the terminal of a middleware chain.
pub type HandlerFunc = Arc<dyn Fn(Arc<dyn Context>) -> HandlerFuture + Send + Sync>;

/// A middleware: wraps a continuation into a new handler.
pub type Middleware = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Wraps an async function into a [`HandlerFunc`].
pub fn handler<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(Arc<dyn Context>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wraps a composition function into a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Chain composition
// =============================================================================

/// Locals key prefix for the next-invocation guards. The dot keeps it out of
/// any application namespace.
const NEXT_GUARD_PREFIX: &str = ".lattice.next";

/// Composes `middlewares` around `endpoint`, right to left.
///
/// `label` namespaces the per-request continuation guards so a route chain
/// and the global chain wrapping it never collide.
pub fn chain(label: &str, middlewares: &[Middleware], endpoint: HandlerFunc) -> HandlerFunc {
    let mut current = endpoint;
    for (idx, layer) in middlewares.iter().enumerate().rev() {
        current = layer(guard_next(format!("{NEXT_GUARD_PREFIX}.{label}.{idx}"), current));
    }
    current
}

/// Wraps a continuation so a second invocation within one request fails with
/// `NEXT_CALLED_TWICE` instead of running the rest of the chain again.
fn guard_next(key: String, inner: HandlerFunc) -> HandlerFunc {
    Arc::new(move |ctx: Arc<dyn Context>| {
        let key = key.clone();
        let inner = inner.clone();
        Box::pin(async move {
            if ctx.local(&key).is_some() {
                return Err(HttpError::internal(
                    "middleware invoked its continuation more than once",
                )
                .with_text_code("NEXT_CALLED_TWICE"));
            }
            ctx.set_local(&key, Value::Bool(true));
            inner(ctx).await
        })
    })
}

// =============================================================================
// Error-handler middleware
// =============================================================================

/// Converts a domain error into the library error shape; the first mapper
/// returning `Some` wins.
pub type ErrorMapper = Arc<dyn Fn(&HttpError) -> Option<HttpError> + Send + Sync>;

/// The top-of-chain middleware that converts returned errors into the JSON
/// error envelope.
///
/// ```rust,ignore
/// let router = Router::new()
///     .with_middleware(ErrorHandler::new()
///         .with_environment("development")
///         .with_stack_trace(true)
///         .into_middleware());
/// ```
pub struct ErrorHandler {
    environment: String,
    stack_trace: bool,
    mappers: Vec<ErrorMapper>,
}

impl ErrorHandler {
    /// Creates an error handler for the "production" environment with stack
    /// traces off.
    pub fn new() -> Self {
        Self {
            environment: "production".to_string(),
            stack_trace: false,
            mappers: Vec::new(),
        }
    }

    /// Sets the environment tag. Stack traces are only ever emitted under
    /// `"development"`.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Enables or disables stack-trace capture.
    pub fn with_stack_trace(mut self, enabled: bool) -> Self {
        self.stack_trace = enabled;
        self
    }

    /// Appends an error mapper. Mappers run in registration order; the first
    /// non-`None` mapping wins.
    pub fn with_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&HttpError) -> Option<HttpError> + Send + Sync + 'static,
    {
        self.mappers.push(Arc::new(mapper));
        self
    }

    /// Builds the middleware. Install it first so it is outermost.
    pub fn into_middleware(self) -> Middleware {
        let this = Arc::new(self);
        Arc::new(move |next: HandlerFunc| {
            let this = this.clone();
            Arc::new(move |ctx: Arc<dyn Context>| {
                let this = this.clone();
                let next = next.clone();
                Box::pin(async move {
                    let Err(err) = next(ctx.clone()).await else {
                        return Ok(());
                    };
                    this.respond(ctx, err)
                })
            })
        })
    }

    /// Maps, classifies, logs, and stages the envelope for `err`.
    fn respond(&self, ctx: Arc<dyn Context>, err: HttpError) -> HandlerResult {
        let mapped = self
            .mappers
            .iter()
            .find_map(|mapper| mapper(&err))
            .unwrap_or(err);

        let status = mapped.status();
        if status.is_server_error() {
            error!(
                code = mapped.text_code(),
                status = status.as_u16(),
                method = %ctx.method(),
                path = %ctx.path(),
                "request failed"
            );
        } else {
            debug!(
                code = mapped.text_code(),
                status = status.as_u16(),
                method = %ctx.method(),
                path = %ctx.path(),
                "request rejected"
            );
        }

        let trace = if self.environment == "development" && self.stack_trace {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };

        if let Err(encode_err) = ctx.json(status, mapped.to_envelope(trace.as_deref())) {
            warn!(error = %encode_err, "failed to stage error envelope");
        }
        Ok(())
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}
