//! WebSocket frame model and the engine transport seam.
//!
//! Adapters wrap their engine's socket type in [`WsSink`]/[`WsSource`]
//! halves; everything above (pumps, context, hub) is engine-independent.
//! The read pump owns the source, the write pump owns the sink, so only one
//! task ever writes to the wire.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::WsResult;

// =============================================================================
// Close codes
// =============================================================================

/// RFC 6455 close codes used by this library.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (rejected origin).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal server error.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Close code plus human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// RFC 6455 close code.
    pub code: u16,
    /// Human-readable explanation.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A 1000 Normal closure.
    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "normal closure")
    }

    /// A 1001 Going Away closure (shutdown).
    pub fn going_away() -> Self {
        Self::new(close_code::GOING_AWAY, "server shutting down")
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A WebSocket frame as seen by application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Close frame, with an optional code and reason.
    Close(Option<CloseFrame>),
}

impl WsMessage {
    /// Short name of the frame type, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            WsMessage::Text(_) => "text",
            WsMessage::Binary(_) => "binary",
            WsMessage::Ping(_) => "ping",
            WsMessage::Pong(_) => "pong",
            WsMessage::Close(_) => "close",
        }
    }

    /// Whether this is a Ping, Pong, or Close control frame.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_)
        )
    }
}

// =============================================================================
// Transport seam
// =============================================================================

/// The write half of an upgraded connection.
#[async_trait]
pub trait WsSink: Send {
    /// Writes one frame to the wire.
    async fn send(&mut self, message: WsMessage) -> WsResult<()>;

    /// Flushes and closes the write half.
    async fn close(&mut self) -> WsResult<()>;
}

/// The read half of an upgraded connection.
#[async_trait]
pub trait WsSource: Send {
    /// Reads the next frame; `None` once the peer closes the stream.
    async fn recv(&mut self) -> Option<WsResult<WsMessage>>;
}

/// Boxed write half.
pub type BoxWsSink = Box<dyn WsSink>;

/// Boxed read half.
pub type BoxWsSource = Box<dyn WsSource>;

/// An upgraded engine connection, ready to split into its two halves.
pub trait WsTransport: Send {
    /// Splits into write and read halves, consumed by the two pumps.
    fn split(self: Box<Self>) -> (BoxWsSink, BoxWsSource);
}
