//! WebSocket route configuration and lifecycle hooks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lattice_core::{Context, HttpError, UpgradeData};

use crate::context::WsContext;
use crate::error::{WsError, WsResult};
use crate::message::WsMessage;

// =============================================================================
// Hook types
// =============================================================================

/// Runs with the full HTTP context before the protocol switch. Returning an
/// error aborts the upgrade with an HTTP error response.
pub type PreUpgradeFn =
    Arc<dyn Fn(Arc<dyn Context>) -> BoxFuture<'static, Result<UpgradeData, HttpError>> + Send + Sync>;

/// Runs after the switch; upgrade data is available on the context.
pub type ConnectFn = Arc<dyn Fn(Arc<WsContext>) -> BoxFuture<'static, WsResult<()>> + Send + Sync>;

/// Per-message callback, the alternative to a manual read loop in the
/// handler.
pub type MessageFn =
    Arc<dyn Fn(Arc<WsContext>, WsMessage) -> BoxFuture<'static, WsResult<()>> + Send + Sync>;

/// Runs on every termination path, with the error that ended the
/// connection, if any.
pub type DisconnectFn =
    Arc<dyn Fn(Arc<WsContext>, Option<WsError>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The user handler invoked on the upgraded connection.
pub type WsHandler = Arc<dyn Fn(Arc<WsContext>) -> BoxFuture<'static, WsResult<()>> + Send + Sync>;

/// Wraps an async function into a [`WsHandler`].
pub fn ws_handler<F, Fut>(f: F) -> WsHandler
where
    F: Fn(Arc<WsContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = WsResult<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

// =============================================================================
// Slow-client policy
// =============================================================================

/// What to do when a broadcast would block on a full outbound queue.
/// Exactly one policy is in force per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowClientPolicy {
    /// Close the slow client's connection and remove it (the default; a log
    /// line identifies the client).
    #[default]
    CloseClient,
    /// Drop the message for that client and count the drop.
    DropMessage,
}

// =============================================================================
// WsConfig
// =============================================================================

/// Configuration for a WebSocket route.
#[derive(Clone)]
pub struct WsConfig {
    /// Allowed `Origin` header values; `"*"` disables the check.
    pub origins: Vec<String>,
    /// Subprotocols offered for negotiation; empty means none.
    pub subprotocols: Vec<String>,
    /// Deadline for a single read from the wire.
    pub read_timeout: Duration,
    /// Deadline for a single write to the wire.
    pub write_timeout: Duration,
    /// Deadline for the upgrade handshake.
    pub handshake_timeout: Duration,
    /// Interval between server Pings.
    pub ping_period: Duration,
    /// How long to wait for any frame (including Pong) before disconnecting.
    pub pong_wait: Duration,
    /// Engine read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Engine write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Largest accepted message in bytes.
    pub max_message_size: usize,
    /// Bound of each connection's outbound queue.
    pub outbound_queue_size: usize,
    /// Behavior when a broadcast hits a full outbound queue.
    pub slow_client_policy: SlowClientPolicy,

    /// Pre-upgrade hook.
    pub on_pre_upgrade: Option<PreUpgradeFn>,
    /// Post-upgrade hook.
    pub on_connect: Option<ConnectFn>,
    /// Per-message callback.
    pub on_message: Option<MessageFn>,
    /// Termination hook.
    pub on_disconnect: Option<DisconnectFn>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
            subprotocols: Vec::new(),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: 1 << 20,
            outbound_queue_size: 256,
            slow_client_policy: SlowClientPolicy::default(),
            on_pre_upgrade: None,
            on_connect: None,
            on_message: None,
            on_disconnect: None,
        }
    }
}

impl WsConfig {
    /// Creates a config with the defaults: all origins allowed, 60s pong
    /// wait, pings at nine tenths of that.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the allowed `Origin` values.
    pub fn with_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Offers subprotocols for negotiation; the first one the client also
    /// offers wins.
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the keepalive pair. `ping_period` is derived as nine tenths of
    /// `pong_wait` so a Pong is always due before the next Ping.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait.mul_f64(0.9);
        self
    }

    /// Sets the ping interval explicitly.
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    /// Sets the per-write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the largest accepted message size.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Sets the outbound queue bound.
    pub fn with_outbound_queue_size(mut self, size: usize) -> Self {
        self.outbound_queue_size = size;
        self
    }

    /// Sets the slow-client policy.
    pub fn with_slow_client_policy(mut self, policy: SlowClientPolicy) -> Self {
        self.slow_client_policy = policy;
        self
    }

    /// Installs the pre-upgrade hook.
    pub fn on_pre_upgrade<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn Context>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<UpgradeData, HttpError>> + Send + 'static,
    {
        self.on_pre_upgrade = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Installs the post-upgrade hook.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<WsContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = WsResult<()>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Installs the per-message callback.
    pub fn on_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<WsContext>, WsMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = WsResult<()>> + Send + 'static,
    {
        self.on_message = Some(Arc::new(move |ctx, msg| Box::pin(hook(ctx, msg))));
        self
    }

    /// Installs the termination hook.
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<WsContext>, Option<WsError>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |ctx, err| Box::pin(hook(ctx, err))));
        self
    }
}

impl std::fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConfig")
            .field("origins", &self.origins)
            .field("ping_period", &self.ping_period)
            .field("pong_wait", &self.pong_wait)
            .field("max_message_size", &self.max_message_size)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("slow_client_policy", &self.slow_client_policy)
            .finish()
    }
}
