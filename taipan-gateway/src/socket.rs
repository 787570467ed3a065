//! Socket seams between the session core and the embedding HTTP client.
//!
//! The session core never dials a socket itself: the embedder supplies a
//! [`SocketConnector`] (normally [`TungsteniteConnector`], but tests script
//! their own peers) and the core works the returned halves through the
//! [`SocketSink`] / [`SocketStream`] traits.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::GatewayError;

/// A frame as seen by the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Peer close frame with its close code, if one was supplied.
    Close(Option<u16>),
}

/// Write half of a gateway socket.
#[async_trait]
pub trait SocketSink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), GatewayError>;

    /// Start the closing handshake with the given close code.
    async fn close(&mut self, code: u16) -> Result<(), GatewayError>;
}

/// Read half of a gateway socket.
#[async_trait]
pub trait SocketStream: Send {
    /// The next frame, or `None` once the connection is gone.
    async fn next_message(&mut self) -> Option<Result<SocketMessage, GatewayError>>;
}

/// Socket factory, the `websocket_connect` surface of the embedding client.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), GatewayError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), GatewayError> {
        let (stream, _response) = connect_async(url).await?;
        let (sink, stream) = stream.split();
        Ok((
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteStream { stream }),
        ))
    }
}

struct TungsteniteSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send_text(&mut self, text: &str) -> Result<(), GatewayError> {
        self.sink
            .send(Message::Text(text.to_owned().into()))
            .await
            .map_err(GatewayError::from)
    }

    async fn close(&mut self, code: u16) -> Result<(), GatewayError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: "".into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(GatewayError::from)
    }
}

struct TungsteniteStream {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketStream for TungsteniteStream {
    async fn next_message(&mut self) -> Option<Result<SocketMessage, GatewayError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(GatewayError::WebSocket(e))),
            };

            let mapped = match message {
                Message::Text(text) => SocketMessage::Text(text.to_string()),
                Message::Binary(data) => SocketMessage::Binary(data.to_vec()),
                Message::Close(frame) => SocketMessage::Close(frame.map(|f| f.code.into())),
                // Pings are answered by tungstenite at the protocol layer.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(mapped));
        }
    }
}
