//! # parley-core
//!
//! Sockets, event routing, broadcasting and presence for the Parley chat
//! engine.
//!
//! This crate provides the layer between the transport engine and the chat
//! handlers:
//!
//! - **Socket** - One connected client, addressable by session id
//! - **EventRouter** - Named-event dispatch, plugged into the engine
//! - **BroadcastRegistry** - Channel membership and fan-out
//! - **PresenceManager** - Online/offline state and the staleness sweep
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Engine    │────▶│ EventRouter │────▶│  Handlers   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│  Registry   │◀────│  Presence   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod channel;
pub mod presence;
pub mod registry;
pub mod router;
pub mod socket;

pub use channel::ChannelId;
pub use presence::{PresenceManager, PRESENCE_UPDATED};
pub use registry::{BroadcastRegistry, EventSink, RegistryStats, SocketId};
pub use router::{EventHandler, EventRouter, RouterError, DISCONNECTED};
pub use socket::Socket;
