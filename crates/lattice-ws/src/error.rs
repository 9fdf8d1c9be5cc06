//! Error types for the WebSocket subsystem.

use thiserror::Error;

// =============================================================================
// Connection Errors
// =============================================================================

/// Errors from a single WebSocket connection.
#[derive(Debug, Clone, Error)]
pub enum WsError {
    /// The connection is closing or closed; reads and writes are rejected.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read or write deadline elapsed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A frame could not be queued or written.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON encoding or decoding of a payload failed.
    #[error("JSON error: {0}")]
    Json(String),

    /// A frame of an unexpected type arrived where JSON was required.
    #[error("expected a text frame, received {0}")]
    UnexpectedFrame(&'static str),

    /// Underlying transport I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

// =============================================================================
// Hub and Room Errors
// =============================================================================

/// Errors from hub and room operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// A room with this id already exists.
    #[error("room '{id}' already exists")]
    RoomExists {
        /// The duplicate room id.
        id: String,
    },

    /// No room with this id.
    #[error("room '{id}' not found")]
    RoomNotFound {
        /// The missing room id.
        id: String,
    },

    /// The room is at its configured capacity.
    #[error("room '{id}' is full ({max} clients)")]
    RoomFull {
        /// The full room's id.
        id: String,
        /// Its configured capacity.
        max: usize,
    },

    /// The client is already a member of the room.
    #[error("connection '{connection}' is already in room '{room}'")]
    AlreadyMember {
        /// The room id.
        room: String,
        /// The duplicate connection id.
        connection: String,
    },

    /// The client is not a member of the room.
    #[error("connection '{connection}' is not in room '{room}'")]
    NotMember {
        /// The room id.
        room: String,
        /// The absent connection id.
        connection: String,
    },

    /// The caller's cancellation fired before the operation was admitted.
    #[error("operation canceled")]
    Canceled,

    /// The hub has been shut down.
    #[error("hub is closed")]
    HubClosed,

    /// No client with this connection id.
    #[error("client '{id}' not found")]
    ClientNotFound {
        /// The missing connection id.
        id: String,
    },

    /// A broadcast payload could not be serialized.
    #[error("broadcast payload failed to serialize: {0}")]
    Serialize(String),
}

impl From<HubError> for WsError {
    fn from(err: HubError) -> Self {
        WsError::Protocol(err.to_string())
    }
}

/// Result type for connection operations.
pub type WsResult<T> = Result<T, WsError>;

/// Result type for hub and room operations.
pub type HubResult<T> = Result<T, HubError>;
