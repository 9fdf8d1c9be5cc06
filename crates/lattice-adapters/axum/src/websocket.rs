//! Bridges axum's WebSocket type onto the lattice transport seam.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use lattice_ws::{
    BoxWsSink, BoxWsSource, CloseFrame, WsError, WsMessage, WsResult, WsSink, WsSource,
    WsTransport,
};

/// An upgraded axum socket, ready to split for the pumps.
pub struct AxumTransport {
    socket: WebSocket,
}

impl AxumTransport {
    /// Wraps an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl WsTransport for AxumTransport {
    fn split(self: Box<Self>) -> (BoxWsSink, BoxWsSource) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(AxumSink { sink }),
            Box::new(AxumSource { stream }),
        )
    }
}

struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

struct AxumSource {
    stream: SplitStream<WebSocket>,
}

fn to_engine(message: WsMessage) -> Message {
    match message {
        WsMessage::Text(text) => Message::Text(text.into()),
        WsMessage::Binary(data) => Message::Binary(data),
        WsMessage::Ping(payload) => Message::Ping(payload),
        WsMessage::Pong(payload) => Message::Pong(payload),
        WsMessage::Close(frame) => Message::Close(frame.map(|f| AxumCloseFrame {
            code: f.code,
            reason: f.reason.into(),
        })),
    }
}

fn from_engine(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text.as_str().to_string()),
        Message::Binary(data) => WsMessage::Binary(data),
        Message::Ping(payload) => WsMessage::Ping(payload),
        Message::Pong(payload) => WsMessage::Pong(payload),
        Message::Close(frame) => WsMessage::Close(
            frame.map(|f| CloseFrame::new(f.code, f.reason.as_str())),
        ),
    }
}

#[async_trait::async_trait]
impl WsSink for AxumSink {
    async fn send(&mut self, message: WsMessage) -> WsResult<()> {
        self.sink
            .send(to_engine(message))
            .await
            .map_err(|e| WsError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> WsResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| WsError::Io(e.to_string()))
    }
}

#[async_trait::async_trait]
impl WsSource for AxumSource {
    async fn recv(&mut self) -> Option<WsResult<WsMessage>> {
        match self.stream.next().await? {
            Ok(message) => Some(Ok(from_engine(message))),
            Err(e) => Some(Err(WsError::Io(e.to_string()))),
        }
    }
}
