//! The engine-adapter capability trait and serve lifecycle types.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::router::Router;

// =============================================================================
// Errors
// =============================================================================

/// Errors from the serve lifecycle.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: String,
        /// Underlying bind failure.
        source: std::io::Error,
    },

    /// The adapter is already serving.
    #[error("server is already running")]
    AlreadyRunning,

    /// Shutdown was requested before `serve`.
    #[error("server is not running")]
    NotRunning,

    /// I/O failure while serving.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for serve-lifecycle operations.
pub type ServeResult<T> = Result<T, ServeError>;

// =============================================================================
// ServeHandle
// =============================================================================

/// Handle to a running listener.
///
/// Dropping the handle cancels the listener's shutdown token; for a graceful
/// stop call [`Server::shutdown`] instead.
#[derive(Debug)]
pub struct ServeHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ServeHandle {
    /// Creates a handle over the resolved bind address and shutdown token.
    pub fn new(local_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            local_addr,
            shutdown,
        }
    }

    /// The address the OS actually bound, including an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The token cancelled when the listener stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals the listener to stop accepting.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Server capability
// =============================================================================

/// An engine adapter: binds one HTTP engine to the routing layer.
#[async_trait]
pub trait Server: Send + Sync {
    /// The route table served by this adapter.
    fn router(&self) -> Arc<Router>;

    /// Binds `addr` and starts serving in the background.
    ///
    /// `addr` may carry port `0`; the returned handle exposes the resolved
    /// address.
    async fn serve(&self, addr: &str) -> ServeResult<ServeHandle>;

    /// Stops accepting new connections, waits up to `deadline` for in-flight
    /// handlers, then force-closes the remainder.
    async fn shutdown(&self, deadline: Duration) -> ServeResult<()>;
}
