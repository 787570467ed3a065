//! Scripted sockets for exercising sessions without a network.
//!
//! [`ScriptedConnector`] hands out channel-backed connections in order; the
//! test keeps a [`ScriptedPeer`] per connection to feed server frames in and
//! observe what the session wrote.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::GatewayError;
use crate::signal::Signal;
use crate::socket::{SocketConnector, SocketMessage, SocketSink, SocketStream};

/// A frame written by the session, as observed by the scripted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Text(String),
    Close(u16),
}

/// The handle a test keeps for one scripted connection.
pub struct ScriptedPeer {
    /// Feed server frames into the session.
    pub inbound: flume::Sender<SocketMessage>,
    /// Observe frames the session wrote.
    pub outbound: flume::Receiver<SentFrame>,
}

impl ScriptedPeer {
    pub fn feed_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(SocketMessage::Text(text.into()));
    }

    pub fn feed_close(&self, code: u16) {
        let _ = self.inbound.send(SocketMessage::Close(Some(code)));
    }

    /// The next text frame the session wrote, skipping close frames.
    pub async fn next_text(&self) -> String {
        loop {
            match self.outbound.recv_async().await.expect("the session hung up") {
                SentFrame::Text(text) => return text,
                SentFrame::Close(_) => {}
            }
        }
    }

    /// The next text frame, parsed as JSON.
    pub async fn next_json(&self) -> serde_json::Value {
        let text = self.next_text().await;
        serde_json::from_str(&text).expect("the session wrote invalid JSON")
    }
}

struct PendingConnection {
    inbound: flume::Receiver<SocketMessage>,
    outbound: flume::Sender<SentFrame>,
    closed: Arc<Signal>,
    /// Whether the session closing its write half also ends the read
    /// stream. A peer that completes the closing handshake does; a silent
    /// peer behind a split transport does not.
    end_stream_on_close: bool,
}

/// Connector that hands out pre-scripted connections in connect order.
pub struct ScriptedConnector {
    pending: Mutex<VecDeque<PendingConnection>>,
}

impl ScriptedConnector {
    /// Build a connector with `connections` scripted sockets whose peers
    /// complete the closing handshake: closing the write half promptly ends
    /// the read stream too. Peer handles are returned in connect order.
    /// Connecting past the script fails with
    /// [`GatewayError::GatewayNotFound`].
    pub fn with_connections(connections: usize) -> (Arc<Self>, Vec<ScriptedPeer>) {
        Self::build(connections, true)
    }

    /// Build a connector whose peers never answer the closing handshake:
    /// the read stream stays pending after the session closes its write
    /// half, exactly like a production split transport talking to a zombied
    /// peer. The read half only ends when the peer handle is dropped.
    pub fn with_detached_connections(connections: usize) -> (Arc<Self>, Vec<ScriptedPeer>) {
        Self::build(connections, false)
    }

    fn build(connections: usize, end_stream_on_close: bool) -> (Arc<Self>, Vec<ScriptedPeer>) {
        let mut pending = VecDeque::with_capacity(connections);
        let mut peers = Vec::with_capacity(connections);

        for _ in 0..connections {
            let (in_tx, in_rx) = flume::unbounded();
            let (out_tx, out_rx) = flume::unbounded();
            pending.push_back(PendingConnection {
                inbound: in_rx,
                outbound: out_tx,
                closed: Arc::new(Signal::new(false)),
                end_stream_on_close,
            });
            peers.push(ScriptedPeer {
                inbound: in_tx,
                outbound: out_rx,
            });
        }

        (
            Arc::new(Self {
                pending: Mutex::new(pending),
            }),
            peers,
        )
    }

    /// Scripted connections not yet handed out.
    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl SocketConnector for ScriptedConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>), GatewayError> {
        let connection = self
            .pending
            .lock()
            .pop_front()
            .ok_or(GatewayError::GatewayNotFound)?;

        let sink = ScriptedSink {
            outbound: connection.outbound,
            closed: Arc::clone(&connection.closed),
            end_stream_on_close: connection.end_stream_on_close,
        };
        let stream = ScriptedStream {
            inbound: connection.inbound,
            closed: connection.closed,
        };
        Ok((Box::new(sink), Box::new(stream)))
    }
}

struct ScriptedSink {
    outbound: flume::Sender<SentFrame>,
    closed: Arc<Signal>,
    end_stream_on_close: bool,
}

#[async_trait]
impl SocketSink for ScriptedSink {
    async fn send_text(&mut self, text: &str) -> Result<(), GatewayError> {
        self.outbound
            .send(SentFrame::Text(text.to_owned()))
            .map_err(|_| GatewayError::InvalidState("the scripted peer hung up"))
    }

    async fn close(&mut self, code: u16) -> Result<(), GatewayError> {
        let _ = self.outbound.send(SentFrame::Close(code));
        if self.end_stream_on_close {
            // The peer answers the handshake and the connection ends.
            self.closed.set();
        }
        Ok(())
    }
}

struct ScriptedStream {
    inbound: flume::Receiver<SocketMessage>,
    closed: Arc<Signal>,
}

#[async_trait]
impl SocketStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<Result<SocketMessage, GatewayError>> {
        tokio::select! {
            biased;
            message = self.inbound.recv_async() => message.ok().map(Ok),
            _ = self.closed.wait() => None,
        }
    }
}
