//! Logging utilities for Lattice applications.
//!
//! A unified logging setup using `tracing` and `tracing-subscriber`.
//! Everything in the toolkit logs structured events; this module wires a
//! subscriber up without forcing one on library consumers.
//!
//! # Example
//!
//! ```rust,ignore
//! use lattice::logging::LoggingBuilder;
//!
//! fn main() {
//!     LoggingBuilder::new()
//!         .directive("lattice_core=debug,lattice_ws=trace")
//!         .init();
//! }
//! ```

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize logging with default settings.
///
/// Sets up a tracing subscriber with environment-based filtering via
/// `RUST_LOG` and a default directive of `info`.
///
/// # Panics
///
/// Panics if a subscriber has already been set.
pub fn init() {
    init_with_filter("info");
}

/// Initialize logging with a custom filter string.
///
/// # Panics
///
/// Panics if a subscriber has already been set.
pub fn init_with_filter(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

/// Try to initialize logging, returning an error instead of panicking.
///
/// Useful when logging may already have been initialized, e.g. in tests.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .try_init()
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
}

/// A builder for configuring logging.
///
/// # Example
///
/// ```rust,ignore
/// use lattice::logging::LoggingBuilder;
/// use tracing::Level;
///
/// LoggingBuilder::new()
///     .with_level(Level::DEBUG)
///     .directive("lattice_ws=trace")
///     .init();
/// ```
#[derive(Debug, Default)]
pub struct LoggingBuilder {
    level: Option<Level>,
    directives: Vec<String>,
}

impl LoggingBuilder {
    /// Creates a builder with the defaults (INFO level).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive like `"lattice_core=debug"`.
    pub fn directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let base = self
            .level
            .map(|l| l.to_string().to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
        for directive in &self.directives {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
        filter
    }

    /// Installs the subscriber.
    ///
    /// # Panics
    ///
    /// Panics if a subscriber has already been set.
    pub fn init(self) {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(self.build_filter())
            .init();
    }

    /// Installs the subscriber, returning an error instead of panicking.
    pub fn try_init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(self.build_filter())
            .try_init()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}
