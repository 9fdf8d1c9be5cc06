//! Bridges a tokio-tungstenite stream onto the lattice transport seam.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use lattice_ws::{
    BoxWsSink, BoxWsSource, CloseFrame, WsError, WsMessage, WsResult, WsSink, WsSource,
    WsTransport,
};

/// An upgraded tungstenite stream, ready to split for the pumps.
pub struct TungsteniteTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a completed server-side handshake.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> WsTransport for TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (BoxWsSink, BoxWsSource) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteSource { stream }),
        )
    }
}

struct TungsteniteSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

struct TungsteniteSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

fn to_engine(message: WsMessage) -> Message {
    match message {
        WsMessage::Text(text) => Message::Text(text.into()),
        WsMessage::Binary(data) => Message::Binary(data),
        WsMessage::Ping(payload) => Message::Ping(payload),
        WsMessage::Pong(payload) => Message::Pong(payload),
        WsMessage::Close(frame) => Message::Close(frame.map(|f| TungsteniteCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into(),
        })),
    }
}

/// Raw `Frame` messages never surface from the high-level stream API; they
/// map to `None` and the source skips them.
fn from_engine(message: Message) -> Option<WsMessage> {
    match message {
        Message::Text(text) => Some(WsMessage::Text(text.as_str().to_string())),
        Message::Binary(data) => Some(WsMessage::Binary(data)),
        Message::Ping(payload) => Some(WsMessage::Ping(payload)),
        Message::Pong(payload) => Some(WsMessage::Pong(payload)),
        Message::Close(frame) => Some(WsMessage::Close(
            frame.map(|f| CloseFrame::new(u16::from(f.code), f.reason.as_str())),
        )),
        Message::Frame(_) => None,
    }
}

#[async_trait::async_trait]
impl<S> WsSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
impl<S> WsSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<WsResult<WsMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => match from_engine(message) {
                    Some(message) => return Some(Ok(message)),
                    None => continue,
                },
                Err(e) => return Some(Err(WsError::Io(e.to_string()))),
            }
        }
    }
}
