//! Per-connection WebSocket context.
//!
//! Application code never touches the socket: writes go through the
//! outbound queue drained by the write pump, and reads come from the
//! inbound queue fed by the read pump (which has already answered Pings and
//! absorbed Pongs). The connection state machine is `Open → Closing →
//! Closed`; once `Closing` is entered — by either side's Close frame or by
//! an I/O error — reads and writes fail with
//! [`WsError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use lattice_core::UpgradeData;

use crate::error::{WsError, WsResult};
use crate::message::{CloseFrame, WsMessage, close_code};

// Connection states.
const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// The per-connection context handed to WebSocket handlers and hooks.
pub struct WsContext {
    connection_id: String,
    outbound: mpsc::Sender<WsMessage>,
    inbound: Mutex<mpsc::Receiver<WsMessage>>,
    state: AtomicU8,
    upgrade_data: Arc<UpgradeData>,
    queries: HashMap<String, String>,
    close_signal: CancellationToken,
}

impl WsContext {
    pub(crate) fn new(
        connection_id: String,
        outbound: mpsc::Sender<WsMessage>,
        inbound: mpsc::Receiver<WsMessage>,
        upgrade_data: Arc<UpgradeData>,
        queries: HashMap<String, String>,
        close_signal: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            outbound,
            inbound: Mutex::new(inbound),
            state: AtomicU8::new(OPEN),
            upgrade_data,
            queries,
            close_signal,
        }
    }

    /// The unique id of this connection.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// A query parameter captured from the upgrade request URL.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.queries.get(key).map(String::as_str)
    }

    /// Pre-upgrade data stored under `key`.
    pub fn upgrade_data(&self, key: &str) -> Option<Value> {
        self.upgrade_data.get(key).cloned()
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// Reads the next application frame (Text or Binary).
    ///
    /// Control frames never surface here: the read pump answers Pings and
    /// refreshes the deadline on Pongs transparently.
    pub async fn read_message(&self) -> WsResult<WsMessage> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.close_signal.cancelled() => Err(WsError::ConnectionClosed),
            message = inbound.recv() => message.ok_or(WsError::ConnectionClosed),
        }
    }

    /// Reads the next Text frame and decodes it as JSON.
    pub async fn read_json<T: DeserializeOwned>(&self) -> WsResult<T> {
        match self.read_message().await? {
            WsMessage::Text(text) => {
                serde_json::from_str(&text).map_err(|e| WsError::Json(e.to_string()))
            }
            other => Err(WsError::UnexpectedFrame(other.kind())),
        }
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Queues a frame for the write pump.
    pub async fn write_message(&self, message: WsMessage) -> WsResult<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| WsError::ConnectionClosed)
    }

    /// Serializes `value` and queues it as a Text frame.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> WsResult<()> {
        let text = serde_json::to_string(value).map_err(|e| WsError::Json(e.to_string()))?;
        self.write_message(WsMessage::Text(text)).await
    }

    /// Queues a Ping control frame.
    pub async fn write_ping(&self, payload: bytes::Bytes) -> WsResult<()> {
        self.write_message(WsMessage::Ping(payload)).await
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Initiates a normal closure (1000).
    pub async fn close(&self) -> WsResult<()> {
        self.close_with_status(close_code::NORMAL, "normal closure")
            .await
    }

    /// Initiates closure with an explicit code and reason.
    ///
    /// The first call transitions `Open → Closing` and hands the Close
    /// frame to the write pump; later calls are no-ops.
    pub async fn close_with_status(&self, code: u16, reason: &str) -> WsResult<()> {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let frame = WsMessage::Close(Some(CloseFrame::new(code, reason)));
        if self.outbound.send(frame).await.is_err() {
            // Write pump already gone; just release the pumps.
            self.close_signal.cancel();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pump-side transitions
    // -------------------------------------------------------------------------

    /// Marks the connection closing (a Close frame or error was observed).
    pub(crate) fn mark_closing(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Marks the socket released.
    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.close_signal.cancel();
    }

    /// Token cancelled when the connection tears down.
    pub(crate) fn close_signal(&self) -> &CancellationToken {
        &self.close_signal
    }

    /// Non-blocking enqueue used by broadcast fan-out.
    pub(crate) fn try_send(
        &self,
        message: WsMessage,
    ) -> Result<(), mpsc::error::TrySendError<WsMessage>> {
        self.outbound.try_send(message)
    }
}

impl std::fmt::Debug for WsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            OPEN => "open",
            CLOSING => "closing",
            _ => "closed",
        };
        f.debug_struct("WsContext")
            .field("connection_id", &self.connection_id)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (Arc<WsContext>, mpsc::Receiver<WsMessage>, mpsc::Sender<WsMessage>) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let ctx = Arc::new(WsContext::new(
            "conn-1".into(),
            out_tx,
            in_rx,
            Arc::new(UpgradeData::new()),
            HashMap::from([("token".to_string(), "good".to_string())]),
            CancellationToken::new(),
        ));
        (ctx, out_rx, in_tx)
    }

    #[tokio::test]
    async fn write_and_read_round_trip_through_queues() {
        let (ctx, mut out_rx, in_tx) = context();

        ctx.write_json(&serde_json::json!({"a": 1})).await.unwrap();
        match out_rx.recv().await.unwrap() {
            WsMessage::Text(text) => assert_eq!(text, r#"{"a":1}"#),
            other => panic!("unexpected {other:?}"),
        }

        in_tx
            .send(WsMessage::Text(r#"{"b":2}"#.into()))
            .await
            .unwrap();
        let value: Value = ctx.read_json().await.unwrap();
        assert_eq!(value["b"], 2);
    }

    #[tokio::test]
    async fn operations_fail_after_closing() {
        let (ctx, mut out_rx, _in_tx) = context();

        ctx.close_with_status(close_code::POLICY_VIOLATION, "bad origin")
            .await
            .unwrap();
        match out_rx.recv().await.unwrap() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::POLICY_VIOLATION);
                assert_eq!(frame.reason, "bad origin");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            ctx.write_message(WsMessage::Text("late".into())).await,
            Err(WsError::ConnectionClosed)
        ));
        assert!(matches!(
            ctx.read_message().await,
            Err(WsError::ConnectionClosed)
        ));

        // A second close is a no-op, not an error.
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn query_and_upgrade_data_access() {
        let (ctx, _out, _in) = context();
        assert_eq!(ctx.query("token"), Some("good"));
        assert_eq!(ctx.query("missing"), None);
        assert_eq!(ctx.upgrade_data("claims"), None);
    }
}
