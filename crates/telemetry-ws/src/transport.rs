//! Transport seam between the engine and the socket implementation.
//!
//! The engine only sees a [`Connector`] that yields a [`FrameWriter`] plus a
//! [`FrameStream`]. The stream ending is the close event; an `Err` item is the
//! error event. [`TungsteniteConnector`] is the production implementation.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{self, Message, protocol::WebSocketConfig},
};
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult};

/// Data frame received from or sent to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Create a text message.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Get as bytes regardless of message type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into text, decoding binary frames as UTF-8.
    pub fn into_text(self) -> TelemetryResult<String> {
        match self {
            Self::Text(s) => Ok(s),
            Self::Binary(b) => Ok(String::from_utf8(b)?),
        }
    }
}

/// Inbound half of an open connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = TelemetryResult<WsMessage>> + Send>>;

/// Outbound half of an open connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> TelemetryResult<()>;

    /// Write a protocol-level ping.
    async fn send_ping(&mut self) -> TelemetryResult<()>;

    /// Start a clean close handshake.
    async fn close(&mut self) -> TelemetryResult<()>;
}

/// Opens transport connections for the engine.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> TelemetryResult<(Box<dyn FrameWriter>, FrameStream)>;
}

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] backed by `tokio-tungstenite`.
///
/// Ping/pong and close frames are handled by tungstenite and never surface
/// as [`WsMessage`]s.
#[derive(Clone, Debug, Default)]
pub struct TungsteniteConnector {
    max_message_size: Option<usize>,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inbound messages larger than `size` at the protocol level.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> TelemetryResult<(Box<dyn FrameWriter>, FrameStream)> {
        let mut config = WebSocketConfig::default();
        if let Some(size) = self.max_message_size {
            config.max_message_size = Some(size);
            config.max_frame_size = Some(size);
        }

        let (ws, response) = connect_async_with_config(url, Some(config), true).await?;
        debug!(status = %response.status(), "WebSocket handshake completed");

        let (sink, stream) = ws.split();
        let writer = TungsteniteWriter { sink };
        Ok((Box::new(writer), inbound_frames(stream)))
    }
}

struct TungsteniteWriter {
    sink: SplitSink<TungsteniteStream, Message>,
}

#[async_trait]
impl FrameWriter for TungsteniteWriter {
    async fn send_text(&mut self, text: String) -> TelemetryResult<()> {
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> TelemetryResult<()> {
        self.sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> TelemetryResult<()> {
        match SinkExt::close(&mut self.sink).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(TelemetryError::from(err)),
        }
    }
}

fn inbound_frames(stream: SplitStream<TungsteniteStream>) -> FrameStream {
    stream
        .filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(Ok(WsMessage::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(WsMessage::Binary(data))),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Close frame received");
                    None
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    None
                }
                Err(err) => Some(Err(TelemetryError::from(err))),
            }
        })
        .boxed()
}
