//! The broadcast registry.
//!
//! The registry is the shared table of live sockets and of which channels
//! each socket has joined. It is the only place per-socket mutable state
//! lives (bound identity and channel membership), so every handler sees the
//! same view through sharded concurrent maps.
//!
//! Deliveries snapshot the membership of a channel under its shard lock and
//! then write to each socket without holding any lock; a socket that
//! disconnects in between is skipped.

use dashmap::DashMap;
use parley_protocol::Frame;
use parley_transport::{SessionHandle, SessionId, TransportError};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::channel::ChannelId;

/// Sockets are addressed by the id of the session that carries them.
pub type SocketId = SessionId;

/// Outbound side of a socket.
pub trait EventSink: Send + Sync {
    /// Queue a frame for the socket without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the socket is closed or cannot accept more frames.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;
}

impl EventSink for SessionHandle {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        SessionHandle::send(self, frame)
    }
}

struct SocketEntry {
    sink: Arc<dyn EventSink>,
    channels: HashSet<ChannelId>,
    identity: Option<String>,
    connected_at: Instant,
}

/// What the registry held for a socket when it was removed.
#[derive(Debug, Clone)]
pub struct RemovedSocket {
    /// Identity bound to the socket, if any.
    pub identity: Option<String>,
    /// Channels the socket was in.
    pub channels: Vec<ChannelId>,
    /// How long the socket was registered.
    pub lifetime: std::time::Duration,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of non-empty channels.
    pub channel_count: usize,
    /// Number of registered sockets.
    pub socket_count: usize,
    /// Total (socket, channel) memberships.
    pub total_subscriptions: usize,
}

/// Shared table of sockets and channel memberships.
#[derive(Default)]
pub struct BroadcastRegistry {
    /// Channel -> member sockets.
    channels: DashMap<ChannelId, HashSet<SocketId>>,
    /// Socket -> sink, identity and joined channels.
    sockets: DashMap<SocketId, SocketEntry>,
}

impl BroadcastRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            socket_count: self.sockets.len(),
            total_subscriptions: self.sockets.iter().map(|s| s.channels.len()).sum(),
        }
    }

    /// Register a socket.
    pub fn add_socket(&self, id: SocketId, sink: Arc<dyn EventSink>) {
        debug!(socket = %id, "Socket registered");
        self.sockets.insert(
            id,
            SocketEntry {
                sink,
                channels: HashSet::new(),
                identity: None,
                connected_at: Instant::now(),
            },
        );
    }

    /// Whether a socket is registered.
    #[must_use]
    pub fn contains(&self, id: &SocketId) -> bool {
        self.sockets.contains_key(id)
    }

    /// Remove a socket from every channel and forget it.
    ///
    /// Returns `None` if the socket was not registered.
    pub fn remove_socket(&self, id: &SocketId) -> Option<RemovedSocket> {
        let (_, entry) = self.sockets.remove(id)?;

        for channel in &entry.channels {
            self.detach(channel, id);
        }

        debug!(socket = %id, channels = entry.channels.len(), "Socket removed");
        Some(RemovedSocket {
            identity: entry.identity,
            channels: entry.channels.into_iter().collect(),
            lifetime: entry.connected_at.elapsed(),
        })
    }

    /// Add a socket to a channel. Returns `true` if it was not already a
    /// member. Unknown sockets and invalid channel keys are ignored.
    pub fn join(&self, id: &SocketId, channel: ChannelId) -> bool {
        if let Err(reason) = channel.validate() {
            debug!(socket = %id, channel = %channel, reason, "Rejected join");
            return false;
        }
        let Some(mut entry) = self.sockets.get_mut(id) else {
            return false;
        };
        if !entry.channels.insert(channel.clone()) {
            return false;
        }

        // Insert while the socket entry is held so a concurrent
        // remove_socket sees this channel and detaches it.
        self.channels
            .entry(channel.clone())
            .or_default()
            .insert(id.clone());
        drop(entry);

        trace!(socket = %id, channel = %channel, "Joined");
        true
    }

    /// Remove a socket from a channel. Returns `true` if it was a member.
    pub fn leave(&self, id: &SocketId, channel: &ChannelId) -> bool {
        let removed = self
            .sockets
            .get_mut(id)
            .map(|mut entry| entry.channels.remove(channel))
            .unwrap_or(false);
        if removed {
            self.detach(channel, id);
            trace!(socket = %id, channel = %channel, "Left");
        }
        removed
    }

    fn detach(&self, channel: &ChannelId, id: &SocketId) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(id);
        }
        self.channels.remove_if(channel, |_, members| members.is_empty());
    }

    /// Bind an identity to a socket.
    pub fn bind_identity(&self, id: &SocketId, row_id: &str) {
        if let Some(mut entry) = self.sockets.get_mut(id) {
            entry.identity = Some(row_id.to_string());
        }
    }

    /// Identity bound to a socket.
    #[must_use]
    pub fn identity(&self, id: &SocketId) -> Option<String> {
        self.sockets.get(id).and_then(|e| e.identity.clone())
    }

    /// Channels a socket has joined.
    #[must_use]
    pub fn channels_of(&self, id: &SocketId) -> Vec<ChannelId> {
        self.sockets
            .get(id)
            .map(|e| e.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sockets in a channel.
    #[must_use]
    pub fn channel_size(&self, channel: &ChannelId) -> usize {
        self.channels.get(channel).map(|m| m.len()).unwrap_or(0)
    }

    fn sink(&self, id: &SocketId) -> Option<Arc<dyn EventSink>> {
        self.sockets.get(id).map(|e| Arc::clone(&e.sink))
    }

    fn deliver(&self, targets: Vec<SocketId>, event: &str, payload: Value) -> usize {
        let frame = Frame::event(event, payload);
        let mut delivered = 0;
        for id in targets {
            let Some(sink) = self.sink(&id) else {
                continue;
            };
            match sink.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(socket = %id, event, error = %e, "Dropped delivery"),
            }
        }
        delivered
    }

    /// Emit an event to every socket in a channel.
    ///
    /// Returns the number of sockets the event was queued for.
    pub fn emit_to(&self, channel: &ChannelId, event: &str, payload: Value) -> usize {
        let targets: Vec<SocketId> = match self.channels.get(channel) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };
        let delivered = self.deliver(targets, event, payload);
        trace!(channel = %channel, event, recipients = delivered, "Broadcast");
        delivered
    }

    /// Emit an event to every connected socket.
    pub fn emit_all(&self, event: &str, payload: Value) -> usize {
        let targets: Vec<SocketId> = self.sockets.iter().map(|e| e.key().clone()).collect();
        self.deliver(targets, event, payload)
    }

    /// Emit an event to a single socket.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the socket is gone, or whatever its sink reports.
    pub fn emit_to_socket(
        &self,
        id: &SocketId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.emit_frame(id, Frame::event(event, payload))
    }

    /// Queue a raw frame for a single socket.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the socket is gone, or whatever its sink reports.
    pub fn emit_frame(&self, id: &SocketId, frame: Frame) -> Result<(), TransportError> {
        let sink = self.sink(id).ok_or(TransportError::ConnectionClosed)?;
        sink.send(frame)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Sink that records every frame it is given.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
    }

    impl RecordingSink {
        /// `(event, first argument)` for each recorded event frame.
        pub(crate) fn events(&self) -> Vec<(String, Value)> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|frame| match frame {
                    Frame::Message {
                        packet: parley_protocol::Packet::Event { name, args, .. },
                    } => Some((name.clone(), args.first().cloned().unwrap_or(Value::Null))),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct ClosedSink;

    impl EventSink for ClosedSink {
        fn send(&self, _frame: Frame) -> Result<(), TransportError> {
            Err(TransportError::ConnectionClosed)
        }
    }

    pub(crate) fn socket(registry: &BroadcastRegistry, id: &str) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        registry.add_socket(SocketId::new(id), sink.clone());
        sink
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = BroadcastRegistry::new();
        let _s1 = socket(&registry, "s1");
        let room = ChannelId::room("r1");

        assert!(registry.join(&"s1".into(), room.clone()));
        assert!(!registry.join(&"s1".into(), room.clone()));
        assert_eq!(registry.channel_size(&room), 1);

        assert!(registry.leave(&"s1".into(), &room));
        assert!(!registry.leave(&"s1".into(), &room));
        assert_eq!(registry.stats().channel_count, 0);
    }

    #[test]
    fn test_join_unknown_socket_is_ignored() {
        let registry = BroadcastRegistry::new();
        assert!(!registry.join(&"ghost".into(), ChannelId::room("r1")));
        assert_eq!(registry.channel_size(&ChannelId::room("r1")), 0);
    }

    #[test]
    fn test_join_rejects_invalid_keys() {
        let registry = BroadcastRegistry::new();
        let _s1 = socket(&registry, "s1");

        assert!(!registry.join(&"s1".into(), ChannelId::personal("")));
        assert!(registry.channels_of(&"s1".into()).is_empty());
        assert_eq!(registry.stats().channel_count, 0);
    }

    #[test]
    fn test_join_racing_remove_leaves_no_orphan() {
        let registry = Arc::new(BroadcastRegistry::new());
        let channel = ChannelId::personal("alice");

        for i in 0..500 {
            let id = SocketId::new(format!("s{}", i));
            registry.add_socket(id.clone(), Arc::new(RecordingSink::default()));

            let joiner = {
                let registry = Arc::clone(&registry);
                let (id, channel) = (id.clone(), channel.clone());
                std::thread::spawn(move || registry.join(&id, channel))
            };
            let remover = {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                std::thread::spawn(move || registry.remove_socket(&id))
            };
            joiner.join().unwrap();
            remover.join().unwrap();

            assert!(!registry.contains(&id));
            assert_eq!(registry.channel_size(&channel), 0, "iteration {}", i);
        }
    }

    #[test]
    fn test_emit_to_channel_members_only() {
        let registry = BroadcastRegistry::new();
        let s1 = socket(&registry, "s1");
        let s2 = socket(&registry, "s2");
        let s3 = socket(&registry, "s3");
        let room = ChannelId::room("r1");
        registry.join(&"s1".into(), room.clone());
        registry.join(&"s2".into(), room.clone());

        let count = registry.emit_to(&room, "chat message", json!({"message": "hi"}));

        assert_eq!(count, 2);
        assert_eq!(s1.events().len(), 1);
        assert_eq!(s2.events()[0].0, "chat message");
        assert!(s3.events().is_empty());
    }

    #[test]
    fn test_emit_skips_failed_sinks() {
        let registry = BroadcastRegistry::new();
        let s1 = socket(&registry, "s1");
        registry.add_socket("s2".into(), Arc::new(ClosedSink));
        let room = ChannelId::room("r1");
        registry.join(&"s1".into(), room.clone());
        registry.join(&"s2".into(), room.clone());

        assert_eq!(registry.emit_to(&room, "x", json!({})), 1);
        assert_eq!(s1.frames().len(), 1);
    }

    #[test]
    fn test_emit_all() {
        let registry = BroadcastRegistry::new();
        let s1 = socket(&registry, "s1");
        let s2 = socket(&registry, "s2");

        assert_eq!(registry.emit_all("presence.updated", json!({"row_id": "a"})), 2);
        assert_eq!(s1.events().len(), 1);
        assert_eq!(s2.events().len(), 1);
    }

    #[test]
    fn test_remove_socket_leaves_all_channels() {
        let registry = BroadcastRegistry::new();
        let _s1 = socket(&registry, "s1");
        let id: SocketId = "s1".into();
        registry.bind_identity(&id, "alice");
        registry.join(&id, ChannelId::personal("alice"));
        registry.join(&id, ChannelId::room("r1"));

        let removed = registry.remove_socket(&id).unwrap();
        assert_eq!(removed.identity.as_deref(), Some("alice"));
        assert_eq!(removed.channels.len(), 2);

        assert!(registry.remove_socket(&id).is_none());
        assert_eq!(registry.emit_to(&ChannelId::room("r1"), "x", json!({})), 0);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                channel_count: 0,
                socket_count: 0,
                total_subscriptions: 0
            }
        );
    }

    #[test]
    fn test_emit_to_missing_socket() {
        let registry = BroadcastRegistry::new();
        assert!(matches!(
            registry.emit_to_socket(&"nope".into(), "x", json!({})),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
