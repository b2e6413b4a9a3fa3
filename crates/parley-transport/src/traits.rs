//! Transport abstraction traits for Parley.
//!
//! These traits define the interface a byte-transport must provide to carry a
//! session, and the callbacks the engine invokes on the layer above it.

use async_trait::async_trait;
use parley_protocol::{Frame, Packet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Counter mixed into generated ids so two sessions opened in the same
/// nanosecond still differ.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new session ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Session was closed or never existed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Session id is not known to the engine.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Request used a transport the session is not on.
    #[error("Invalid transport: {0}")]
    InvalidTransport(&'static str),

    /// A poll is already pending for this session.
    #[error("Duplicate poll request")]
    DuplicatePoll,

    /// Inbound payload exceeds the configured maximum.
    #[error("Payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    /// Upgrade handshake did not finish in time.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] parley_protocol::ProtocolError),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The byte-transport closed cleanly.
    TransportClose,
    /// The byte-transport failed.
    TransportError,
    /// No pong arrived within the heartbeat timeout.
    PingTimeout,
    /// The client sent a close frame.
    ClientClose,
    /// The server is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError => "transport error",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::ClientClose => "client close",
            CloseReason::ServerShutdown => "server shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write half of a streaming connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a streaming connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// A persistent, bidirectional byte-transport (e.g. WebSocket).
///
/// The engine splits a connection so reads and writes can proceed
/// concurrently on separate tasks.
pub trait Connection: Send {
    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independent write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

/// Callbacks from the engine to the layer above it.
#[async_trait]
pub trait EngineHandler: Send + Sync {
    /// A session was opened.
    async fn on_open(&self, session: crate::engine::SessionHandle);

    /// An event-layer packet arrived on a session.
    async fn on_message(&self, session: &SessionId, packet: Packet);

    /// A session ended. Called exactly once per session.
    async fn on_close(&self, session: &SessionId, reason: CloseReason);
}
