//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum `WebSocket`. Text messages carry the engine.io
//! text encoding; binary messages carry the length-prefixed MessagePack
//! encoding. Replies use whichever encoding the client last sent.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, Frame, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{Connection, FrameSink, FrameStream, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<String>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<String>, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr,
            max_message_size,
        }
    }
}

impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.socket.split();
        let binary = Arc::new(AtomicBool::new(false));
        (
            Box::new(WebSocketSink {
                sink,
                binary: Arc::clone(&binary),
            }),
            Box::new(WebSocketStream {
                stream,
                binary,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    binary: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = if self.binary.load(Ordering::Relaxed) {
            Message::Binary(codec::encode(&frame)?.to_vec())
        } else {
            Message::Text(codec::encode_text(&frame)?)
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

struct WebSocketStream {
    stream: SplitStream<WebSocket>,
    binary: Arc<AtomicBool>,
    max_message_size: usize,
}

impl WebSocketStream {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    self.binary.store(false, Ordering::Relaxed);
                    return Ok(Some(codec::decode_text(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.binary.store(true, Ordering::Relaxed);
                    return Ok(Some(codec::decode(&data)?));
                }
                // axum answers protocol-level pings itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}
