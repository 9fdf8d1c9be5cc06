//! The hub-facing client abstraction above a raw connection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;

use crate::context::WsContext;
use crate::error::WsResult;
use crate::message::WsMessage;

/// A connected client registered with the hub.
///
/// Rooms store connection ids only; this is the object those ids resolve to
/// through the hub's client map. Destroyed when the connection's read pump
/// returns.
pub struct WsClient {
    ctx: Arc<WsContext>,
    rooms: RwLock<BTreeSet<String>>,
    state: RwLock<BTreeMap<String, Value>>,
    dropped_messages: AtomicU64,
}

impl WsClient {
    /// Wraps a connection context into a hub client.
    pub fn new(ctx: Arc<WsContext>) -> Self {
        Self {
            ctx,
            rooms: RwLock::new(BTreeSet::new()),
            state: RwLock::new(BTreeMap::new()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// The connection id.
    pub fn id(&self) -> &str {
        self.ctx.connection_id()
    }

    /// The underlying connection context.
    pub fn context(&self) -> &Arc<WsContext> {
        &self.ctx
    }

    // -------------------------------------------------------------------------
    // Session state
    // -------------------------------------------------------------------------

    /// Reads a session-state entry.
    pub fn state(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    /// Writes a session-state entry.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state.write().insert(key.into(), value);
    }

    /// Snapshot of the whole session-state map.
    pub fn state_snapshot(&self) -> BTreeMap<String, Value> {
        self.state.read().clone()
    }

    /// The presence value recorded when this client joins a
    /// presence-tracking room: the `"presence"` state entry, or `Null`.
    pub fn presence_value(&self) -> Value {
        self.state("presence").unwrap_or(Value::Null)
    }

    // -------------------------------------------------------------------------
    // Room membership (maintained by Room)
    // -------------------------------------------------------------------------

    /// Ids of the rooms this client currently belongs to.
    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    pub(crate) fn record_join(&self, room_id: &str) {
        self.rooms.write().insert(room_id.to_string());
    }

    pub(crate) fn record_leave(&self, room_id: &str) {
        self.rooms.write().remove(room_id);
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Queues a frame, waiting for queue space.
    pub async fn send(&self, message: WsMessage) -> WsResult<()> {
        self.ctx.write_message(message).await
    }

    /// Serializes `value` and queues it as a Text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> WsResult<()> {
        self.ctx.write_json(value).await
    }

    /// Non-blocking enqueue used by broadcast fan-out; a full queue
    /// surfaces as `Err` for the slow-client policy to handle.
    pub(crate) fn try_send(&self, message: WsMessage) -> Result<(), TrySendError<WsMessage>> {
        self.ctx.try_send(message)
    }

    /// Counts one message dropped by the [`DropMessage`] policy.
    ///
    /// [`DropMessage`]: crate::config::SlowClientPolicy::DropMessage
    pub(crate) fn record_dropped(&self) -> u64 {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Messages dropped for this client by the drop policy.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("id", &self.id())
            .field("rooms", &self.joined_rooms())
            .finish()
    }
}
