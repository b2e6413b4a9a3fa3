//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat engine.
//!
//! This crate defines the frames exchanged between Parley clients and the
//! server, the event packets carried inside them, and the codecs for both
//! the text (engine.io/socket.io compatible) and binary encodings.
//!
//! ## Frame Types
//!
//! - `Open` / `Close` - Session lifecycle
//! - `Ping` / `Pong` - Heartbeat and upgrade probes
//! - `Message` - Event-layer packets (`Connect`, `Event`, `Ack`, ...)
//! - `Upgrade` / `Noop` - Transport switching
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::event("chat message", json!({"room_id": "r1", "content": "hi"}));
//!
//! let text = codec::encode_text(&frame).unwrap();
//! assert_eq!(codec::decode_text(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use frames::{Frame, FrameType, Handshake, Packet, PacketType};
pub use version::{Version, PROTOCOL_VERSION};
