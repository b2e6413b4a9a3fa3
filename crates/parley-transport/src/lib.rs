//! # parley-transport
//!
//! Session transport engine for the Parley chat server.
//!
//! A session is addressable by its id no matter which byte-transport carries
//! it:
//!
//! - **Polling** - HTTP long-polling, served by [`Engine::poll`] and
//!   [`Engine::ingest_payload`]
//! - **WebSocket** - a persistent socket driven by [`Engine::serve`]
//!
//! Polling sessions can be upgraded to a WebSocket in place. The engine runs
//! the heartbeat and reports session lifecycle to an [`EngineHandler`].
//!
//! ```rust,ignore
//! use parley_transport::{Engine, EngineConfig, TransportKind};
//!
//! let engine = Engine::new(EngineConfig::default(), handler);
//! let handshake = engine.open(TransportKind::Polling).await;
//! ```

pub mod engine;
pub mod memory;
pub mod traits;
pub mod upgrade;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use engine::{Engine, EngineConfig, SessionHandle};
pub use traits::{
    CloseReason, Connection, EngineHandler, FrameSink, FrameStream, SessionId, TransportError,
};
pub use upgrade::TransportKind;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
