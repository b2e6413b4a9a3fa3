//! Event router for Parley.
//!
//! The router turns engine sessions into [`Socket`]s and dispatches each
//! inbound event to the handler registered for its name. Handlers for one
//! socket run one at a time, in arrival order.

use async_trait::async_trait;
use parley_protocol::{Frame, Packet};
use parley_transport::{CloseReason, EngineHandler, SessionHandle, SessionId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::registry::BroadcastRegistry;
use crate::socket::Socket;

/// Event raised by the router itself when a transport goes away.
pub const DISCONNECTED: &str = "disconnected";

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A handler is already registered for this event.
    #[error("Handler already registered for event: {0}")]
    DuplicateHandler(String),

    /// Event names cannot be empty.
    #[error("Event name cannot be empty")]
    EmptyEventName,
}

/// A handler for one named event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the event's first argument, sent by `socket`.
    async fn call(&self, socket: Socket, payload: Value);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Socket, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn call(&self, socket: Socket, payload: Value) {
        (self)(socket, payload).await;
    }
}

/// Dispatches named events to handlers.
pub struct EventRouter {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    registry: Arc<BroadcastRegistry>,
}

impl EventRouter {
    /// Create a router over a registry.
    #[must_use]
    pub fn new(registry: Arc<BroadcastRegistry>) -> Self {
        Self {
            handlers: HashMap::new(),
            registry,
        }
    }

    /// The registry sockets are tracked in.
    #[must_use]
    pub fn registry(&self) -> &Arc<BroadcastRegistry> {
        &self.registry
    }

    /// Register the handler for an event name.
    ///
    /// # Errors
    ///
    /// Each name may be registered once; a second registration fails.
    pub fn on<H>(&mut self, event: impl Into<String>, handler: H) -> Result<(), RouterError>
    where
        H: EventHandler + 'static,
    {
        let event = event.into();
        if event.is_empty() {
            return Err(RouterError::EmptyEventName);
        }
        if self.handlers.contains_key(&event) {
            return Err(RouterError::DuplicateHandler(event));
        }
        debug!(event = %event, "Registered handler");
        self.handlers.insert(event, Arc::new(handler));
        Ok(())
    }

    /// Registered event names.
    #[must_use]
    pub fn events(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Run the handler for `event`. Returns `false` if none is registered.
    pub async fn dispatch(&self, socket: Socket, event: &str, payload: Value) -> bool {
        let Some(handler) = self.handlers.get(event).cloned() else {
            debug!(socket = %socket.id(), event, "No handler for event");
            return false;
        };
        trace!(socket = %socket.id(), event, "Dispatching");
        handler.call(socket, payload).await;
        true
    }

    fn socket(&self, id: &SessionId) -> Socket {
        Socket::new(id.clone(), Arc::clone(&self.registry))
    }

    /// Drop a socket from every channel, then tell the `disconnected`
    /// handler which identity went away.
    async fn drop_socket(&self, id: &SessionId, reason: &str) {
        let Some(removed) = self.registry.remove_socket(id) else {
            return;
        };
        info!(
            socket = %id,
            reason,
            lifetime_ms = removed.lifetime.as_millis() as u64,
            "Socket disconnected"
        );
        if let Some(row_id) = removed.identity {
            let payload = json!({ "row_id": row_id, "reason": reason });
            self.dispatch(self.socket(id), DISCONNECTED, payload).await;
        }
    }
}

#[async_trait]
impl EngineHandler for EventRouter {
    async fn on_open(&self, session: SessionHandle) {
        let id = session.id().clone();
        self.registry.add_socket(id, Arc::new(session));
    }

    async fn on_message(&self, session: &SessionId, packet: Packet) {
        match packet {
            Packet::Connect { .. } => {
                let reply = Packet::Connect {
                    data: Some(json!({ "sid": session.as_str() })),
                };
                if let Err(e) = self
                    .registry
                    .emit_frame(session, Frame::message(reply))
                {
                    debug!(socket = %session, error = %e, "Connect reply dropped");
                }
            }
            Packet::Event { id, name, mut args } => {
                let payload = if args.is_empty() {
                    Value::Null
                } else {
                    args.swap_remove(0)
                };
                self.dispatch(self.socket(session), &name, payload).await;

                if let Some(id) = id {
                    let ack = Frame::message(Packet::Ack { id, args: Vec::new() });
                    let _ = self.registry.emit_frame(session, ack);
                }
            }
            Packet::Disconnect => self.drop_socket(session, "client namespace disconnect").await,
            other => {
                debug!(socket = %session, packet = ?other.packet_type(), "Ignoring packet");
            }
        }
    }

    async fn on_close(&self, session: &SessionId, reason: CloseReason) {
        self.drop_socket(session, reason.as_str()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::registry::tests::socket;
    use std::sync::Mutex;

    fn router() -> EventRouter {
        EventRouter::new(Arc::new(BroadcastRegistry::new()))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut router = router();
        router.on("chat message", |_s: Socket, _p: Value| async {}).unwrap();

        let err = router
            .on("chat message", |_s: Socket, _p: Value| async {})
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateHandler(name) if name == "chat message"));
        assert!(matches!(
            router.on("", |_s: Socket, _p: Value| async {}),
            Err(RouterError::EmptyEventName)
        ));
    }

    #[tokio::test]
    async fn test_event_dispatches_first_argument() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = router();
        {
            let seen = seen.clone();
            router
                .on("rooms list", move |socket: Socket, payload: Value| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push((socket.id().clone(), payload));
                    }
                })
                .unwrap();
        }
        let _sink = socket(router.registry(), "s1");

        let packet = Packet::Event {
            id: None,
            name: "rooms list".into(),
            args: vec![json!({"row_id": "alice"}), json!("extra")],
        };
        router.on_message(&"s1".into(), packet).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, json!({"row_id": "alice"}));
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let router = router();
        let _sink = socket(router.registry(), "s1");
        assert!(!router.dispatch(router.socket(&"s1".into()), "nope", json!({})).await);
    }

    #[tokio::test]
    async fn test_connect_packet_is_acknowledged() {
        let router = router();
        let sink = socket(router.registry(), "s1");

        router
            .on_message(&"s1".into(), Packet::Connect { data: None })
            .await;

        assert_eq!(
            sink.frames(),
            vec![Frame::message(Packet::Connect {
                data: Some(json!({"sid": "s1"}))
            })]
        );
    }

    #[tokio::test]
    async fn test_event_with_id_is_acked() {
        let mut router = router();
        router.on("ping me", |_s: Socket, _p: Value| async {}).unwrap();
        let sink = socket(router.registry(), "s1");

        let packet = Packet::Event {
            id: Some(7),
            name: "ping me".into(),
            args: vec![json!({})],
        };
        router.on_message(&"s1".into(), packet).await;

        assert_eq!(
            sink.frames(),
            vec![Frame::message(Packet::Ack { id: 7, args: vec![] })]
        );
    }

    #[tokio::test]
    async fn test_close_leaves_rooms_before_disconnected_handler() {
        let observed = Arc::new(Mutex::new(None));
        let mut router = router();
        {
            let observed = observed.clone();
            router
                .on(DISCONNECTED, move |socket: Socket, payload: Value| {
                    let observed = observed.clone();
                    async move {
                        let size = socket
                            .registry()
                            .channel_size(&ChannelId::room("r1"));
                        *observed.lock().unwrap() = Some((payload, size));
                    }
                })
                .unwrap();
        }
        let _sink = socket(router.registry(), "s1");
        let id: SessionId = "s1".into();
        router.registry().bind_identity(&id, "alice");
        router.registry().join(&id, ChannelId::room("r1"));

        router.on_close(&id, CloseReason::PingTimeout).await;

        let (payload, size) = observed.lock().unwrap().clone().unwrap();
        assert_eq!(payload["row_id"], "alice");
        assert_eq!(payload["reason"], "ping timeout");
        assert_eq!(size, 0);
        assert!(!router.registry().contains(&id));
    }

    #[tokio::test]
    async fn test_close_without_identity_skips_handler() {
        let called = Arc::new(Mutex::new(false));
        let mut router = router();
        {
            let called = called.clone();
            router
                .on(DISCONNECTED, move |_s: Socket, _p: Value| {
                    let called = called.clone();
                    async move {
                        *called.lock().unwrap() = true;
                    }
                })
                .unwrap();
        }
        let _sink = socket(router.registry(), "s1");

        router.on_close(&"s1".into(), CloseReason::TransportClose).await;
        assert!(!*called.lock().unwrap());
    }
}
