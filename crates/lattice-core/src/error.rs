//! Unified error types for the Lattice core.
//!
//! Two error families live here:
//!
//! - [`HttpError`] — the value handlers and middleware return. Every error
//!   carries an HTTP status, a machine-readable text code, a human message,
//!   and optional validation details / metadata / wrapped cause. The
//!   error-handler middleware renders it as the JSON envelope.
//! - [`RouteError`] — registration-time failures (conflicting routes,
//!   malformed patterns, duplicate names). These fail loudly during setup
//!   and never reach request handling.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// =============================================================================
// Error Kinds
// =============================================================================

/// Classification of an [`HttpError`].
///
/// Every kind maps deterministically to one HTTP status and one text code;
/// [`ErrorKind::Custom`] carries its own pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Parse or validation failure at ingress (400).
    BadRequest,
    /// Missing or invalid credentials (401).
    Unauthorized,
    /// Authenticated but not allowed (403).
    Forbidden,
    /// No route or resource (404).
    NotFound,
    /// Path exists under other methods only (405).
    MethodNotAllowed,
    /// State collision such as a duplicate id (409).
    Conflict,
    /// Field-level validation errors present (422).
    ValidationFailed,
    /// Unclassified failure (500).
    Internal,
    /// Backpressure or shutdown (503).
    Unavailable,
    /// Caller-supplied text code and status.
    Custom {
        /// Machine-readable text code, e.g. `"TEAPOT"`.
        code: String,
        /// HTTP status for this error.
        status: u16,
    },
}

impl ErrorKind {
    /// The HTTP status this kind maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Custom { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// The machine-readable text code this kind maps to.
    pub fn text_code(&self) -> &str {
        match self {
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Custom { code, .. } => code,
        }
    }
}

// =============================================================================
// Field Errors
// =============================================================================

/// One field-level validation failure, rendered inside `validation_errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Name of the offending field.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl FieldError {
    /// Creates a field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// HttpError
// =============================================================================

/// The error value returned by handlers and middleware.
///
/// Built with the kind constructors and refined with the fluent setters:
///
/// ```rust
/// use lattice_core::error::HttpError;
///
/// let err = HttpError::conflict("user already exists")
///     .with_metadata_entry("user_id", serde_json::json!(42));
/// assert_eq!(err.status().as_u16(), 409);
/// ```
#[derive(Clone)]
pub struct HttpError {
    kind: ErrorKind,
    /// Overrides the kind's default status when set via [`with_status`](Self::with_status).
    status_override: Option<StatusCode>,
    /// Overrides the kind's default text code when set via [`with_text_code`](Self::with_text_code).
    code_override: Option<String>,
    message: String,
    validation_errors: Vec<FieldError>,
    metadata: BTreeMap<String, Value>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HttpError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_override: None,
            code_override: None,
            message: message.into(),
            validation_errors: Vec::new(),
            metadata: BTreeMap::new(),
            source: None,
        }
    }

    // -------------------------------------------------------------------------
    // Constructors (one per kind)
    // -------------------------------------------------------------------------

    /// Creates a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates a 401 Unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Creates a 403 Forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Creates a 404 Not Found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates a 405 Method Not Allowed error.
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotAllowed, message)
    }

    /// Creates a 409 Conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Creates a 422 error carrying field-level validation failures.
    pub fn validation(message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        let mut err = Self::new(ErrorKind::ValidationFailed, message);
        err.validation_errors = fields;
        err
    }

    /// Creates a 500 Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Creates a 500 Internal error wrapping an underlying cause.
    pub fn internal_from(
        cause: impl std::error::Error + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::Internal, message);
        err.source = Some(Arc::new(cause));
        err
    }

    /// Creates a 503 Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Creates an error with a caller-chosen text code and status.
    pub fn custom(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Custom {
                code: code.into(),
                status,
            },
            message,
        )
    }

    // -------------------------------------------------------------------------
    // Fluent setters
    // -------------------------------------------------------------------------

    /// Merges entries into the metadata map.
    pub fn with_metadata(mut self, entries: BTreeMap<String, Value>) -> Self {
        self.metadata.extend(entries);
        self
    }

    /// Inserts a single metadata entry.
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Overrides the HTTP status. Out-of-range codes fall back to 500.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_override =
            Some(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
        self
    }

    /// Overrides the machine-readable text code.
    pub fn with_text_code(mut self, code: impl Into<String>) -> Self {
        self.code_override = Some(code.into());
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The error classification.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The effective HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status_override.unwrap_or_else(|| self.kind.status())
    }

    /// The effective machine-readable text code.
    pub fn text_code(&self) -> &str {
        self.code_override
            .as_deref()
            .unwrap_or_else(|| self.kind.text_code())
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Field-level validation failures, empty for non-validation errors.
    pub fn validation_errors(&self) -> &[FieldError] {
        &self.validation_errors
    }

    /// Arbitrary metadata attached to this error.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Renders the JSON envelope body for this error.
    ///
    /// `stack_trace` is attached only when the error-handler middleware is
    /// configured for development with stack traces enabled.
    pub fn to_envelope(&self, stack_trace: Option<&str>) -> Value {
        let mut inner = serde_json::Map::new();
        inner.insert("code".into(), Value::String(self.text_code().to_string()));
        inner.insert("status".into(), Value::from(self.status().as_u16()));
        inner.insert("message".into(), Value::String(self.message.clone()));
        if !self.validation_errors.is_empty() {
            // FieldError is a plain Serialize struct; to_value cannot fail.
            if let Ok(fields) = serde_json::to_value(&self.validation_errors) {
                inner.insert("validation_errors".into(), fields);
            }
        }
        if !self.metadata.is_empty() {
            inner.insert(
                "metadata".into(),
                Value::Object(self.metadata.clone().into_iter().collect()),
            );
        }
        if let Some(trace) = stack_trace {
            inner.insert("stack_trace".into(), Value::String(trace.to_string()));
        }
        let mut outer = serde_json::Map::new();
        outer.insert("error".into(), Value::Object(inner));
        Value::Object(outer)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.text_code(), self.message)
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("kind", &self.kind)
            .field("status", &self.status().as_u16())
            .field("code", &self.text_code())
            .field("message", &self.message)
            .field("validation_errors", &self.validation_errors)
            .finish()
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

// =============================================================================
// Registration Errors
// =============================================================================

/// Errors raised while building the route table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The same `(method, normalized pattern)` was registered twice.
    #[error("conflicting route: {method} {pattern} is already registered")]
    ConflictingRoute {
        /// HTTP method of the offending registration.
        method: String,
        /// Normalized path pattern.
        pattern: String,
    },

    /// The pattern cannot be compiled into the trie.
    #[error("malformed pattern '{pattern}': {reason}")]
    MalformedPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two routes were registered under the same name.
    #[error("duplicate route name '{name}'")]
    DuplicateRouteName {
        /// The duplicated name.
        name: String,
    },

    /// Reverse lookup for an unregistered name.
    #[error("no route named '{name}'")]
    UnknownRouteName {
        /// The missing name.
        name: String,
    },

    /// Reverse construction is missing a required parameter.
    #[error("missing parameter '{param}' for route pattern '{pattern}'")]
    MissingParam {
        /// The absent parameter name.
        param: String,
        /// The pattern being filled in.
        pattern: String,
    },

    /// A route builder reached registration without a handler.
    #[error("route '{pattern}' has no handler")]
    MissingHandler {
        /// The pattern missing its handler.
        pattern: String,
    },
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for request handlers and middleware.
pub type HandlerResult = Result<(), HttpError>;

/// Result type for route-table construction.
pub type RouteResult<T> = Result<T, RouteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_fixed_status_and_code() {
        assert_eq!(ErrorKind::BadRequest.status().as_u16(), 400);
        assert_eq!(ErrorKind::ValidationFailed.status().as_u16(), 422);
        assert_eq!(ErrorKind::Unavailable.text_code(), "UNAVAILABLE");
        assert_eq!(
            ErrorKind::Custom {
                code: "TEAPOT".into(),
                status: 418
            }
            .status()
            .as_u16(),
            418
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let err = HttpError::not_found("gone")
            .with_status(410)
            .with_text_code("GONE");
        assert_eq!(err.status().as_u16(), 410);
        assert_eq!(err.text_code(), "GONE");
    }

    #[test]
    fn validation_envelope_shape() {
        let err = HttpError::validation("bad", vec![FieldError::new("name", "required")]);
        let envelope = err.to_envelope(None);
        let inner = &envelope["error"];
        assert_eq!(inner["code"], "VALIDATION_FAILED");
        assert_eq!(inner["status"], 422);
        assert_eq!(inner["validation_errors"].as_array().map(Vec::len), Some(1));
        assert_eq!(inner["validation_errors"][0]["field"], "name");
        assert!(inner.get("metadata").is_none());
        assert!(inner.get("stack_trace").is_none());
    }

    #[test]
    fn stack_trace_only_when_provided() {
        let err = HttpError::internal("boom");
        let envelope = err.to_envelope(Some("at main.rs:1"));
        assert_eq!(envelope["error"]["stack_trace"], "at main.rs:1");
    }

    #[test]
    fn internal_from_preserves_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = HttpError::internal_from(io, "write failed");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk on fire"));
    }
}
