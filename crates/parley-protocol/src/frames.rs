//! Frame types for the Parley protocol.
//!
//! Two layers travel over a connection:
//!
//! - **Frames** belong to the engine layer: handshake, heartbeat, upgrade and
//!   the `message` envelope. Their type identifiers match engine.io v4 packet
//!   digits so stock socket.io clients can talk to the server.
//! - **Packets** ride inside `message` frames and carry named events for the
//!   session/event router (socket.io v5 packet types, default namespace only).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Close),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::Pong),
            4 => Ok(FrameType::Message),
            5 => Ok(FrameType::Upgrade),
            6 => Ok(FrameType::Noop),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Packet type identifiers for the event layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PacketType {
    /// Client attaches to the default namespace.
    Connect = 0,
    /// Client detaches from the default namespace.
    Disconnect = 1,
    /// Named event with arguments.
    Event = 2,
    /// Acknowledgement of an event that carried an id.
    Ack = 3,
    /// Namespace connection refused.
    ConnectError = 4,
}

impl From<PacketType> for u8 {
    fn from(pt: PacketType) -> u8 {
        pt as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Connect),
            1 => Ok(PacketType::Disconnect),
            2 => Ok(PacketType::Event),
            3 => Ok(PacketType::Ack),
            4 => Ok(PacketType::ConnectError),
            _ => Err("Invalid packet type"),
        }
    }
}

/// Parameters advertised to the client when a session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session identifier.
    pub sid: String,
    /// Transports the session may upgrade to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Heartbeat interval in milliseconds.
    pub ping_interval: u64,
    /// How long the server waits for a pong, in milliseconds.
    pub ping_timeout: u64,
    /// Largest accepted inbound payload in bytes.
    pub max_payload: u64,
}

/// An event-layer packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Packet {
    /// Attach to the default namespace; the server answers with `{sid}` data.
    #[serde(rename = "connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Detach from the default namespace.
    #[serde(rename = "disconnect")]
    Disconnect,

    /// A named event.
    #[serde(rename = "event")]
    Event {
        /// Acknowledgement id requested by the sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Event name.
        name: String,
        /// Event arguments, usually a single object.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Reply to an event carrying `id`.
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Namespace connection refused.
    #[serde(rename = "connect_error")]
    ConnectError { message: String },
}

impl Packet {
    /// Get the packet type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect { .. } => PacketType::Connect,
            Packet::Disconnect => PacketType::Disconnect,
            Packet::Event { .. } => PacketType::Event,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::ConnectError { .. } => PacketType::ConnectError,
        }
    }

    /// Create an event packet with a single payload argument.
    #[must_use]
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Packet::Event {
            id: None,
            name: name.into(),
            args: vec![payload],
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Session opened.
    #[serde(rename = "open")]
    Open { handshake: Handshake },

    /// Session closing.
    #[serde(rename = "close")]
    Close,

    /// Liveness probe. `probe` is set during a transport upgrade.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        probe: bool,
    },

    /// Liveness reply.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        probe: bool,
    },

    /// Event-layer packet.
    #[serde(rename = "message")]
    Message { packet: Packet },

    /// Commit a transport upgrade.
    #[serde(rename = "upgrade")]
    Upgrade,

    /// Releases a pending poll.
    #[serde(rename = "noop")]
    Noop,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open { .. } => FrameType::Open,
            Frame::Close => FrameType::Close,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Message { .. } => FrameType::Message,
            Frame::Upgrade => FrameType::Upgrade,
            Frame::Noop => FrameType::Noop,
        }
    }

    /// Create an Open frame.
    #[must_use]
    pub fn open(handshake: Handshake) -> Self {
        Frame::Open { handshake }
    }

    /// Create a heartbeat Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { probe: false }
    }

    /// Create a heartbeat Pong frame.
    #[must_use]
    pub fn pong() -> Self {
        Frame::Pong { probe: false }
    }

    /// Create a Message frame wrapping a packet.
    #[must_use]
    pub fn message(packet: Packet) -> Self {
        Frame::Message { packet }
    }

    /// Create a Message frame carrying a named event.
    #[must_use]
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Frame::message(Packet::event(name, payload))
    }

    /// Whether this frame is a heartbeat reply.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        matches!(self, Frame::Pong { probe: false })
    }
}
