//! In-process connection backed by channels.
//!
//! Used to drive the engine without a network, e.g. in tests.

use async_trait::async_trait;
use parley_protocol::{codec, Frame, ProtocolError};
use tokio::sync::mpsc;

use crate::traits::{Connection, FrameSink, FrameStream, TransportError};

/// Create a connected pair: the server half for the engine and the client
/// half for the caller.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryClient) {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();
    (
        MemoryConnection {
            to_client,
            from_client,
        },
        MemoryClient {
            to_server: Some(to_server),
            from_server,
        },
    )
}

/// Server half of an in-memory connection.
pub struct MemoryConnection {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Result<Frame, ProtocolError>>,
}

impl Connection for MemoryConnection {
    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let this = *self;
        (
            Box::new(MemorySink {
                tx: Some(this.to_client),
            }),
            Box::new(MemoryStream {
                rx: this.from_client,
            }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, ProtocolError>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(decoded) => Ok(Some(decoded?)),
            None => Ok(None),
        }
    }
}

/// Client half of an in-memory connection.
pub struct MemoryClient {
    to_server: Option<mpsc::UnboundedSender<Result<Frame, ProtocolError>>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryClient {
    /// Send a frame to the server. Silently dropped after `close`.
    pub fn send(&self, frame: Frame) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Send a raw text message, decoded on the server side the way a
    /// WebSocket text message is.
    pub fn send_text(&self, text: &str) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(codec::decode_text(text));
        }
    }

    /// Next frame from the server, `None` once the server hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Close the client's write side, which the server reads as a clean close.
    pub fn close(&mut self) {
        self.to_server = None;
    }
}
