//! Addressable socket handles.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::channel::ChannelId;
use crate::registry::{BroadcastRegistry, SocketId};

/// A handle to one connected client, passed to every event handler.
///
/// The handle is cheap to clone and holds no state of its own; membership
/// and identity live in the [`BroadcastRegistry`].
#[derive(Clone)]
pub struct Socket {
    id: SocketId,
    registry: Arc<BroadcastRegistry>,
}

impl Socket {
    /// Create a handle for a registered socket.
    #[must_use]
    pub fn new(id: SocketId, registry: Arc<BroadcastRegistry>) -> Self {
        Self { id, registry }
    }

    /// Socket id (the session id).
    #[must_use]
    pub fn id(&self) -> &SocketId {
        &self.id
    }

    /// Shared registry, for broadcasts beyond this socket.
    #[must_use]
    pub fn registry(&self) -> &Arc<BroadcastRegistry> {
        &self.registry
    }

    /// Join a channel. Redundant joins are no-ops.
    pub fn join(&self, channel: ChannelId) -> bool {
        self.registry.join(&self.id, channel)
    }

    /// Leave a channel. Leaving a channel not joined is a no-op.
    pub fn leave(&self, channel: &ChannelId) -> bool {
        self.registry.leave(&self.id, channel)
    }

    /// Remember which identity this socket belongs to.
    pub fn bind_identity(&self, row_id: &str) {
        self.registry.bind_identity(&self.id, row_id);
    }

    /// Identity bound to this socket, if any.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.registry.identity(&self.id)
    }

    /// Emit an event to this socket only.
    ///
    /// A socket that has gone away drops the event.
    pub fn emit(&self, event: &str, payload: Value) {
        if let Err(e) = self.registry.emit_to_socket(&self.id, event, payload) {
            debug!(socket = %self.id, event, error = %e, "Emit dropped");
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).finish()
    }
}
