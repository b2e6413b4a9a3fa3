//! Chat event handlers.
//!
//! Each client event maps to one handler on [`ChatService`]. Handlers keep
//! no state between calls: they decode the payload, talk to storage under a
//! deadline, and publish results through the broadcast registry. A failed
//! handler reports `error {function, message}` to the requesting socket
//! only; the connection stays open.

pub mod requests;

use parley_core::{
    BroadcastRegistry, ChannelId, EventRouter, PresenceManager, RouterError, Socket, DISCONNECTED,
    PRESENCE_UPDATED,
};
use parley_store::models::{now_millis, to_rfc3339};
use parley_store::{
    with_deadline, ChatStore, MessageEdit, NewMember, NewMessage, NewRoom, Page, RoomKind,
    RoomLookup, RoomQuery, StoreError,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;
use requests::{
    decode, ChatMessageRequest, CreateRoomRequest, DisconnectedRequest, IdentityRequest,
    JoinRoomRequest, MessageReadRequest, MessageUpdateRequest, PresencePingRequest,
    RoomHistoryRequest, RoomsRequest,
};

/// Client event names.
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const CREATE_ROOM: &str = "create room";
    pub const JOIN_ROOM: &str = "join room";
    pub const ROOMS_LIST: &str = "rooms list";
    pub const ROOM_HISTORY: &str = "room history";
    pub const CHAT_MESSAGE: &str = "chat message";
    pub const MESSAGE_READ: &str = "message:read";
    pub const MESSAGE_UPDATE: &str = "message:update";
    pub const PRESENCE_CONNECTED: &str = "presence:connected";
    pub const PRESENCE_PING: &str = "presence:ping";
    pub const PRESENCE_GET: &str = "presence:get";
    pub const DISCONNECTED: &str = super::DISCONNECTED;

    /// Server-only events.
    pub const CHECK_ROOM: &str = "check room";
    pub const MESSAGE_READ_BROADCAST: &str = "message.read";
    pub const MESSAGE_UPDATED: &str = "message.update";
    pub const ERROR: &str = "error";
}

/// Why a handler failed.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed payload or missing field.
    #[error("{0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Storage failed or missed its deadline while doing `action`.
    #[error("failed to {action}: {source}")]
    Storage {
        action: &'static str,
        #[source]
        source: StoreError,
    },

    /// A result could not be serialized.
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    pub(crate) fn validation(message: &str) -> Self {
        ChatError::Validation(message.to_string())
    }

    fn storage(action: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| ChatError::Storage { action, source }
    }

    /// Message safe to show the client. Storage causes are never included.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Validation(message) => message.clone(),
            ChatError::NotFound(what) => format!("{} not found", what),
            ChatError::Storage { action, source } if source.is_timeout() => {
                format!("failed to {}: storage is busy, try again", action)
            }
            ChatError::Storage { action, .. } => format!("failed to {}", action),
            ChatError::Encode(_) => "internal error".to_string(),
        }
    }

    /// Metric label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::NotFound(_) => "not_found",
            ChatError::Storage { .. } => "storage",
            ChatError::Encode(_) => "encode",
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, ChatError> {
    Ok(serde_json::to_value(value)?)
}

/// The chat protocol, bound to storage, the registry and presence.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    registry: Arc<BroadcastRegistry>,
    presence: PresenceManager,
    call_timeout: Duration,
}

impl ChatService {
    /// Create the service. Every storage call it makes is bounded by
    /// `call_timeout`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<BroadcastRegistry>,
        presence: PresenceManager,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            presence,
            call_timeout,
        }
    }

    /// Register a handler for every client event.
    ///
    /// # Errors
    ///
    /// Fails if any of the events already has a handler.
    pub fn register(self: &Arc<Self>, router: &mut EventRouter) -> Result<(), RouterError> {
        route(router, self, events::CONNECTED, |chat, socket, payload| async move {
            chat.on_connected(&socket, payload).await
        })?;
        route(router, self, events::CREATE_ROOM, |chat, socket, payload| async move {
            chat.on_create_room(&socket, payload).await
        })?;
        route(router, self, events::JOIN_ROOM, |chat, socket, payload| async move {
            chat.on_join_room(&socket, payload).await
        })?;
        route(router, self, events::ROOMS_LIST, |chat, socket, payload| async move {
            chat.on_rooms_list(&socket, payload).await
        })?;
        route(router, self, events::ROOM_HISTORY, |chat, socket, payload| async move {
            chat.on_room_history(&socket, payload).await
        })?;
        route(router, self, events::CHAT_MESSAGE, |chat, socket, payload| async move {
            chat.on_chat_message(&socket, payload).await
        })?;
        route(router, self, events::MESSAGE_READ, |chat, socket, payload| async move {
            chat.on_message_read(&socket, payload).await
        })?;
        route(router, self, events::MESSAGE_UPDATE, |chat, socket, payload| async move {
            chat.on_message_update(&socket, payload).await
        })?;
        route(router, self, events::PRESENCE_CONNECTED, |chat, socket, payload| async move {
            chat.on_presence_connected(&socket, payload).await
        })?;
        route(router, self, events::PRESENCE_PING, |chat, socket, payload| async move {
            chat.on_presence_ping(&socket, payload).await
        })?;
        route(router, self, events::PRESENCE_GET, |chat, socket, payload| async move {
            chat.on_presence_get(&socket, payload).await
        })?;
        route(router, self, events::DISCONNECTED, |chat, socket, payload| async move {
            chat.on_disconnected(&socket, payload).await
        })?;
        Ok(())
    }

    async fn call<T, F>(&self, action: &'static str, fut: F) -> Result<T, ChatError>
    where
        F: Future<Output = parley_store::Result<T>>,
    {
        with_deadline(self.call_timeout, fut)
            .await
            .map_err(ChatError::storage(action))
    }

    async fn rooms_payload(
        &self,
        row_id: &str,
        kind: Option<RoomKind>,
        page: Page,
    ) -> Result<Value, ChatError> {
        let query = RoomQuery {
            row_id: row_id.to_string(),
            kind,
            page,
        };
        let list = self.call("load rooms", self.store.room_list(&query)).await?;
        to_payload(&list.rooms)
    }

    fn broadcast(&self, channel: &ChannelId, event: &'static str, payload: Value) -> usize {
        let recipients = self.registry.emit_to(channel, event, payload);
        metrics::record_broadcast(event, recipients);
        debug!(channel = %channel, event, recipients, "Broadcast");
        recipients
    }

    /// Push a fresh room list to every socket of `row_id`.
    async fn refresh_rooms(&self, row_id: &str, kind: Option<RoomKind>, page: Page) {
        match self.rooms_payload(row_id, kind, page).await {
            Ok(rooms) => {
                self.broadcast(&ChannelId::personal(row_id), events::ROOMS_LIST, rooms);
            }
            Err(e) => warn!(row_id, error = %e, "Room list refresh failed"),
        }
    }

    /// `connected`: bind the socket to its identity, mark it online and
    /// return its rooms.
    pub async fn on_connected(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: RoomsRequest = decode(payload)?;
        let kind = req.kind_filter()?;

        socket.join(ChannelId::personal(&req.row_id));
        socket.bind_identity(&req.row_id);

        self.presence
            .connect(&req.row_id)
            .await
            .map_err(ChatError::storage("update presence"))?;
        metrics::record_presence_update("online");

        let rooms = self.rooms_payload(&req.row_id, kind, req.paging.page()).await?;
        socket.emit(events::ROOMS_LIST, rooms);
        Ok(())
    }

    /// `create room`: resolve to an existing room when one matches,
    /// otherwise create it along with its memberships.
    pub async fn on_create_room(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: CreateRoomRequest = decode(payload)?;
        let kind = req.room_kind()?;

        let lookup = RoomLookup {
            kind,
            project_id: req.project_id.clone(),
            row_id: req.row_id.clone(),
            to_row_id: req.peer(),
            item_id: req.item(),
        };
        if let Some(room_id) = self.call("check room", self.store.room_exists(&lookup)).await? {
            return self.join_existing(socket, &req, kind, room_id).await;
        }

        let new_room = NewRoom {
            name: req.name.clone(),
            kind,
            project_id: req.project_id.clone(),
            item_id: req.item(),
            row_id: req.row_id.clone(),
            to_row_id: req.peer(),
        };
        let outcome = self.call("create room", self.store.room_create(&new_room)).await?;
        if !outcome.created {
            // Another request created the same room first.
            return self.join_existing(socket, &req, kind, outcome.room.id).await;
        }
        let room_id = outcome.room.id;
        info!(room = %room_id, kind = %kind, row_id = %req.row_id, "Room created");

        let creator = NewMember {
            room_id: room_id.clone(),
            row_id: req.row_id.clone(),
            to_name: req.to_name.clone(),
            to_row_id: req.peer(),
            attributes: req.member_attributes(),
        };
        self.call("add member", self.store.member_add(&creator)).await?;

        if kind == RoomKind::Single {
            if let (Some(peer), Some(from_name)) = (req.peer(), req.peer_display_name()) {
                let reciprocal = NewMember {
                    room_id: room_id.clone(),
                    row_id: peer.clone(),
                    to_name: from_name,
                    to_row_id: Some(req.row_id.clone()),
                    attributes: req.peer_attributes(),
                };
                self.call("add member", self.store.member_add(&reciprocal)).await?;
                self.refresh_rooms(&peer, None, Page::default()).await;
            }
        }

        let rooms = self
            .rooms_payload(&req.row_id, Some(kind), req.paging.page())
            .await?;
        socket.emit(events::ROOMS_LIST, rooms);
        Ok(())
    }

    async fn join_existing(
        &self,
        socket: &Socket,
        req: &CreateRoomRequest,
        kind: RoomKind,
        room_id: String,
    ) -> Result<(), ChatError> {
        let member = NewMember {
            room_id: room_id.clone(),
            row_id: req.row_id.clone(),
            to_name: req.to_name.clone(),
            to_row_id: req.peer(),
            attributes: req.member_attributes(),
        };
        self.call("add member", self.store.member_add(&member)).await?;
        debug!(room = %room_id, row_id = %req.row_id, "Room already exists");

        socket.emit(events::CHECK_ROOM, Value::String(room_id));
        let rooms = self
            .rooms_payload(&req.row_id, Some(kind), req.paging.page())
            .await?;
        socket.emit(events::ROOMS_LIST, rooms);
        Ok(())
    }

    /// `join room`: mark the room read, make the caller a member, subscribe
    /// the socket and send history plus the refreshed room list.
    pub async fn on_join_room(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: JoinRoomRequest = decode(payload)?;
        let kind = req.kind_filter()?;
        let page = req.paging.page();

        self.call(
            "update last read",
            self.store
                .member_touch_read(&req.room_id, &req.row_id, now_millis()),
        )
        .await?;

        let room = self
            .call("load room", self.store.room_get(&req.room_id))
            .await?
            .ok_or(ChatError::NotFound("room"))?;

        let member = NewMember {
            room_id: room.id.clone(),
            row_id: req.row_id.clone(),
            to_name: req.to_name.clone(),
            to_row_id: req.peer(),
            attributes: req.member_attributes(),
        };
        self.call("add member", self.store.member_add(&member)).await?;
        socket.join(ChannelId::room(&room.id));

        let history = self
            .call("load history", self.store.message_list(&room.id, page))
            .await?;
        if !history.messages.is_empty() {
            socket.emit(events::ROOM_HISTORY, to_payload(&history.messages)?);
        }

        let rooms = self.rooms_payload(&req.row_id, kind, page).await?;
        socket.emit(events::ROOMS_LIST, rooms);
        Ok(())
    }

    /// `rooms list`.
    pub async fn on_rooms_list(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: RoomsRequest = decode(payload)?;
        let rooms = self
            .rooms_payload(&req.row_id, req.kind_filter()?, req.paging.page())
            .await?;
        socket.emit(events::ROOMS_LIST, rooms);
        Ok(())
    }

    /// `room history`: one page of messages, oldest first.
    pub async fn on_room_history(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: RoomHistoryRequest = decode(payload)?;
        let history = self
            .call(
                "load history",
                self.store.message_list(&req.room_id, req.paging.page()),
            )
            .await?;
        socket.emit(events::ROOM_HISTORY, to_payload(&history.messages)?);
        Ok(())
    }

    /// `chat message`: store the message, fan it out to the room, then
    /// refresh every member's room list.
    pub async fn on_chat_message(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: ChatMessageRequest = decode(payload)?;
        let page = req.paging.page();

        self.call("load room", self.store.room_get(&req.room_id))
            .await?
            .ok_or(ChatError::NotFound("room"))?;

        self.call(
            "update last read",
            self.store
                .member_touch_read(&req.room_id, &req.author_row_id, now_millis()),
        )
        .await?;

        let new_message = NewMessage {
            room_id: req.room_id.clone(),
            message: req.content.clone(),
            kind: req.message_kind(),
            file: req.file.clone(),
            author_row_id: req.author_row_id.clone(),
            from_name: req.from.clone(),
            parent_id: req.parent(),
        };
        let message = self
            .call("send message", self.store.message_create(&new_message))
            .await?;
        debug!(socket = %socket.id(), room = %message.room_id, message = %message.id, "Message stored");

        self.broadcast(
            &ChannelId::room(&req.room_id),
            events::CHAT_MESSAGE,
            to_payload(&message)?,
        );

        let members = self
            .call("load members", self.store.members_by_room(&req.room_id))
            .await?;
        for member in members {
            self.refresh_rooms(&member.row_id, None, page).await;
        }
        Ok(())
    }

    /// `message:read`: stamp every unread message by others and tell the
    /// room, unless nothing changed.
    pub async fn on_message_read(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: MessageReadRequest = decode(payload)?;
        let now = now_millis();

        self.call(
            "update last read",
            self.store.member_touch_read(&req.room_id, &req.row_id, now),
        )
        .await?;
        let marked = self
            .call(
                "mark read",
                self.store.message_mark_read(&req.room_id, &req.row_id, now),
            )
            .await?;

        if !marked.updated {
            debug!(socket = %socket.id(), room = %req.room_id, "Nothing to mark read");
            return Ok(());
        }

        self.broadcast(
            &ChannelId::room(&marked.room_id),
            events::MESSAGE_READ_BROADCAST,
            json!({
                "room_id": marked.room_id,
                "by": req.row_id,
                "read_at": to_rfc3339(marked.read_at),
            }),
        );
        Ok(())
    }

    /// `message:update`: apply the given fields and answer the requester.
    pub async fn on_message_update(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: MessageUpdateRequest = decode(payload)?;
        let edit = MessageEdit {
            id: req.id.clone(),
            message: req.content.clone(),
            file: req.file.clone(),
            kind: req.kind.clone(),
        };
        let updated = self
            .call("update message", self.store.message_update(&edit))
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        socket.emit(events::MESSAGE_UPDATED, to_payload(&updated)?);
        Ok(())
    }

    /// `presence:connected`.
    pub async fn on_presence_connected(
        &self,
        socket: &Socket,
        payload: Value,
    ) -> Result<(), ChatError> {
        let req: IdentityRequest = decode(payload)?;
        socket.join(ChannelId::personal(&req.row_id));
        socket.bind_identity(&req.row_id);

        self.presence
            .connect(&req.row_id)
            .await
            .map_err(ChatError::storage("update presence"))?;
        metrics::record_presence_update("online");
        Ok(())
    }

    /// `presence:ping`: heartbeat, remembering the project.
    pub async fn on_presence_ping(&self, _socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: PresencePingRequest = decode(payload)?;
        self.presence
            .heartbeat(&req.row_id, Some(&req.project_id))
            .await
            .map_err(ChatError::storage("update presence"))?;
        Ok(())
    }

    /// `presence:get`: answer the requester only.
    pub async fn on_presence_get(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: IdentityRequest = decode(payload)?;
        let presence = self
            .presence
            .get(&req.row_id)
            .await
            .map_err(ChatError::storage("get presence"))?
            .ok_or(ChatError::NotFound("presence"))?;
        socket.emit(PRESENCE_UPDATED, to_payload(&presence)?);
        Ok(())
    }

    /// `disconnected`: mark the identity offline.
    ///
    /// When the router raised the event for a dropped transport, an identity
    /// that still has another socket stays online.
    pub async fn on_disconnected(&self, socket: &Socket, payload: Value) -> Result<(), ChatError> {
        let req: DisconnectedRequest = decode(payload)?;

        if let Some(reason) = &req.reason {
            let remaining = self
                .registry
                .channel_size(&ChannelId::personal(&req.row_id));
            if remaining > 0 {
                debug!(
                    socket = %socket.id(),
                    row_id = %req.row_id,
                    reason = %reason,
                    remaining,
                    "Identity still connected elsewhere"
                );
                return Ok(());
            }
        }

        self.presence
            .disconnect(&req.row_id)
            .await
            .map_err(ChatError::storage("update presence"))?;
        metrics::record_presence_update("offline");
        Ok(())
    }
}

/// Register one handler, wrapping it with metrics and error reporting.
fn route<F, Fut>(
    router: &mut EventRouter,
    chat: &Arc<ChatService>,
    event: &'static str,
    handler: F,
) -> Result<(), RouterError>
where
    F: Fn(Arc<ChatService>, Socket, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ChatError>> + Send + 'static,
{
    let chat = Arc::clone(chat);
    router.on(event, move |socket: Socket, payload: Value| {
        let started = Instant::now();
        let call = handler(Arc::clone(&chat), socket.clone(), payload);
        async move {
            if let Err(e) = call.await {
                report(&socket, event, &e);
            }
            metrics::record_event(event, started.elapsed());
        }
    })
}

fn report(socket: &Socket, event: &'static str, err: &ChatError) {
    match err {
        ChatError::Storage { source, .. } => {
            if source.is_timeout() {
                metrics::record_storage_timeout();
            }
            error!(socket = %socket.id(), event, error = %err, "Storage call failed");
        }
        ChatError::Encode(_) => error!(socket = %socket.id(), event, error = %err, "Handler failed"),
        _ => debug!(socket = %socket.id(), event, error = %err, "Rejected request"),
    }
    metrics::record_error(err.kind());
    socket.emit(
        events::ERROR,
        json!({ "function": event, "message": err.client_message() }),
    );
}

#[cfg(test)]
mod tests;
