//! Codecs for encoding and decoding Parley frames.
//!
//! Two encodings are supported:
//!
//! - **Text**: engine.io/socket.io packet strings (`4{"…"}` style). Used by
//!   polling payloads and websocket text messages.
//! - **Binary**: MessagePack with a 4-byte big-endian length prefix. Used by
//!   websocket binary messages.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::frames::{Frame, FrameType, Packet, PacketType};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Separator between packets in a polling payload.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON body could not be encoded or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Empty text frame.
    #[error("Empty frame")]
    Empty,

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to length-prefixed MessagePack bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Encode a frame as an engine.io text packet.
///
/// # Errors
///
/// Returns an error if a JSON body cannot be serialized or the result is too large.
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    let text = match frame {
        Frame::Open { handshake } => format!("0{}", serde_json::to_string(handshake)?),
        Frame::Close => "1".to_string(),
        Frame::Ping { probe: true } => "2probe".to_string(),
        Frame::Ping { probe: false } => "2".to_string(),
        Frame::Pong { probe: true } => "3probe".to_string(),
        Frame::Pong { probe: false } => "3".to_string(),
        Frame::Message { packet } => format!("4{}", encode_packet(packet)?),
        Frame::Upgrade => "5".to_string(),
        Frame::Noop => "6".to_string(),
    };

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

fn encode_packet(packet: &Packet) -> Result<String, ProtocolError> {
    let kind = u8::from(packet.packet_type());
    let body = match packet {
        Packet::Connect { data: Some(data) } => serde_json::to_string(data)?,
        Packet::Connect { data: None } | Packet::Disconnect => String::new(),
        Packet::Event { id, name, args } => {
            let mut items = Vec::with_capacity(args.len() + 1);
            items.push(Value::String(name.clone()));
            items.extend(args.iter().cloned());
            let id = id.map(|i| i.to_string()).unwrap_or_default();
            format!("{id}{}", serde_json::to_string(&items)?)
        }
        Packet::Ack { id, args } => format!("{id}{}", serde_json::to_string(args)?),
        Packet::ConnectError { message } => {
            serde_json::to_string(&serde_json::json!({ "message": message }))?
        }
    };
    Ok(format!("{kind}{body}"))
}

/// Decode an engine.io text packet.
///
/// # Errors
///
/// Returns an error if the packet type is unknown or its body is malformed.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let (kind, rest) = split_type(text)?;
    let frame_type = FrameType::try_from(kind).map_err(|e| ProtocolError::Invalid(e.into()))?;

    let frame = match frame_type {
        FrameType::Open => Frame::Open {
            handshake: serde_json::from_str(rest)?,
        },
        FrameType::Close => Frame::Close,
        FrameType::Ping => Frame::Ping {
            probe: rest == "probe",
        },
        FrameType::Pong => Frame::Pong {
            probe: rest == "probe",
        },
        FrameType::Message => Frame::Message {
            packet: decode_packet(rest)?,
        },
        FrameType::Upgrade => Frame::Upgrade,
        FrameType::Noop => Frame::Noop,
    };

    Ok(frame)
}

fn split_type(text: &str) -> Result<(u8, &str), ProtocolError> {
    let first = text.chars().next().ok_or(ProtocolError::Empty)?;
    let digit = first
        .to_digit(10)
        .ok_or_else(|| ProtocolError::Invalid(format!("unknown packet type {first:?}")))?;
    Ok((digit as u8, &text[first.len_utf8()..]))
}

fn decode_packet(text: &str) -> Result<Packet, ProtocolError> {
    let (kind, mut rest) = split_type(text)?;
    let packet_type = PacketType::try_from(kind).map_err(|e| ProtocolError::Invalid(e.into()))?;

    // Optional namespace, only the default one is served.
    if rest.starts_with('/') {
        let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
        if namespace != "/" {
            return Err(ProtocolError::Invalid(format!(
                "unsupported namespace {namespace}"
            )));
        }
        rest = tail;
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let id = if digits > 0 {
        Some(
            rest[..digits]
                .parse::<u64>()
                .map_err(|e| ProtocolError::Invalid(e.to_string()))?,
        )
    } else {
        None
    };
    let body = &rest[digits..];

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect {
            data: if body.is_empty() {
                None
            } else {
                Some(serde_json::from_str(body)?)
            },
        },
        PacketType::Disconnect => Packet::Disconnect,
        PacketType::Event => {
            let mut items: Vec<Value> = serde_json::from_str(body)?;
            if items.is_empty() {
                return Err(ProtocolError::Invalid("event without a name".into()));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(ProtocolError::Invalid(format!(
                        "event name must be a string, got {other}"
                    )))
                }
            };
            Packet::Event {
                id,
                name,
                args: items,
            }
        }
        PacketType::Ack => Packet::Ack {
            id: id.ok_or_else(|| ProtocolError::Invalid("ack without an id".into()))?,
            args: if body.is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(body)?
            },
        },
        PacketType::ConnectError => {
            let value: Value = serde_json::from_str(body)?;
            let message = match value {
                Value::String(s) => s,
                Value::Object(ref map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            };
            Packet::ConnectError { message }
        }
    };

    Ok(packet)
}

/// Encode several frames as one polling payload.
///
/// # Errors
///
/// Returns an error if any frame fails to encode.
pub fn encode_payload(frames: &[Frame]) -> Result<String, ProtocolError> {
    let parts = frames
        .iter()
        .map(encode_text)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(&RECORD_SEPARATOR.to_string()))
}

/// Decode a polling payload into frames.
///
/// # Errors
///
/// Returns an error if any packet in the payload is malformed.
pub fn decode_payload(payload: &str) -> Result<Vec<Frame>, ProtocolError> {
    payload
        .split(RECORD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(decode_text)
        .collect()
}
