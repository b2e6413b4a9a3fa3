use super::*;
use parley_core::EventSink;
use parley_protocol::{Frame, Packet};
use parley_store::{PresenceStatus, SqliteStore};
use parley_transport::{SessionId, TransportError};
use std::sync::Mutex;

#[derive(Default)]
struct Inbox {
    frames: Mutex<Vec<Frame>>,
}

impl EventSink for Inbox {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

impl Inbox {
    /// First argument of every event with this name, draining nothing.
    fn named(&self, event: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Message {
                    packet: Packet::Event { name, args, .. },
                } if name == event => Some(args.first().cloned().unwrap_or(Value::Null)),
                _ => None,
            })
            .collect()
    }

    fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

struct Harness {
    chat: Arc<ChatService>,
    store: Arc<SqliteStore>,
    registry: Arc<BroadcastRegistry>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_store(SqliteStore::in_memory().await.unwrap())
    }

    fn with_store(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(BroadcastRegistry::new());
        let timeout = Duration::from_secs(5);
        let presence = PresenceManager::new(store.clone(), registry.clone(), timeout);
        let chat = Arc::new(ChatService::new(
            store.clone(),
            registry.clone(),
            presence,
            timeout,
        ));
        Self {
            chat,
            store,
            registry,
        }
    }

    fn socket(&self, id: &str) -> (Socket, Arc<Inbox>) {
        let inbox = Arc::new(Inbox::default());
        self.registry.add_socket(SessionId::new(id), inbox.clone());
        (Socket::new(SessionId::new(id), self.registry.clone()), inbox)
    }

    /// A socket that sent `connected` for `row_id`, with its inbox cleared.
    async fn connected(&self, id: &str, row_id: &str) -> (Socket, Arc<Inbox>) {
        let (socket, inbox) = self.socket(id);
        self.chat
            .on_connected(&socket, json!({ "row_id": row_id }))
            .await
            .unwrap();
        inbox.clear();
        (socket, inbox)
    }

    fn router(&self) -> EventRouter {
        let mut router = EventRouter::new(self.registry.clone());
        self.chat.register(&mut router).unwrap();
        router
    }
}

fn single_room(from: &str, to: &str) -> Value {
    json!({
        "row_id": from,
        "project_id": "p1",
        "type": "single",
        "to_row_id": to,
        "to_name": to.to_uppercase(),
        "from_name": from.to_uppercase(),
    })
}

#[tokio::test]
async fn test_connected_binds_identity_and_lists_rooms() {
    let h = Harness::new().await;
    let (_observer, observer_inbox) = h.socket("s0");
    let (socket, inbox) = h.socket("s1");

    h.chat
        .on_connected(&socket, json!({ "row_id": "alice", "limit": 0 }))
        .await
        .unwrap();

    assert_eq!(socket.identity().as_deref(), Some("alice"));
    assert_eq!(h.registry.channel_size(&ChannelId::personal("alice")), 1);
    assert_eq!(inbox.named(events::ROOMS_LIST), vec![json!([])]);

    let updates = observer_inbox.named(PRESENCE_UPDATED);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["row_id"], "alice");
    assert_eq!(updates[0]["status"], "online");
}

#[tokio::test]
async fn test_invalid_payload_reports_error_to_sender_only() {
    let h = Harness::new().await;
    let router = h.router();
    let (socket, inbox) = h.socket("s1");
    let (_other, other_inbox) = h.socket("s2");

    router
        .dispatch(socket.clone(), events::ROOMS_LIST, json!({ "type": "group" }))
        .await;
    router
        .dispatch(socket.clone(), events::CHAT_MESSAGE, json!("hello"))
        .await;

    let errors = inbox.named(events::ERROR);
    assert_eq!(
        errors,
        vec![
            json!({ "function": "rooms list", "message": "row_id is required" }),
            json!({ "function": "chat message", "message": "invalid payload" }),
        ]
    );
    assert!(other_inbox.named(events::ERROR).is_empty());
    assert!(h.registry.contains(socket.id()));
}

#[tokio::test]
async fn test_every_event_registered_once() {
    let h = Harness::new().await;
    let mut router = h.router();

    let mut names = router.events();
    names.sort_unstable();
    assert_eq!(names.len(), 12);
    assert!(names.contains(&"presence:ping"));
    assert!(names.contains(&DISCONNECTED));

    assert!(matches!(
        h.chat.register(&mut router),
        Err(RouterError::DuplicateHandler(_))
    ));
}

#[tokio::test]
async fn test_alice_and_bob() {
    let h = Harness::new().await;
    let (alice, alice_inbox) = h.connected("s-alice", "alice").await;
    let (bob, bob_inbox) = h.connected("s-bob", "bob").await;

    // Alice opens a direct room with Bob; Bob is added and told about it.
    h.chat
        .on_create_room(&alice, single_room("alice", "bob"))
        .await
        .unwrap();
    let alice_rooms = alice_inbox.named(events::ROOMS_LIST);
    assert_eq!(alice_rooms.len(), 1);
    let room_id = alice_rooms[0][0]["id"].as_str().unwrap().to_string();
    assert_eq!(alice_rooms[0][0]["to_name"], "BOB");
    let bob_rooms = bob_inbox.named(events::ROOMS_LIST);
    assert_eq!(bob_rooms[0][0]["id"], room_id.as_str());
    assert_eq!(bob_rooms[0][0]["to_name"], "ALICE");

    // Bob asking for the same pair resolves to the existing room.
    bob_inbox.clear();
    h.chat
        .on_create_room(&bob, single_room("bob", "alice"))
        .await
        .unwrap();
    assert_eq!(bob_inbox.named(events::CHECK_ROOM), vec![json!(room_id)]);
    assert_eq!(h.store.members_by_room(&room_id).await.unwrap().len(), 2);

    for (socket, row_id) in [(&alice, "alice"), (&bob, "bob")] {
        h.chat
            .on_join_room(socket, json!({ "room_id": room_id, "row_id": row_id }))
            .await
            .unwrap();
    }
    alice_inbox.clear();
    bob_inbox.clear();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Bob writes; both sockets get the message and a refreshed list.
    h.chat
        .on_chat_message(
            &bob,
            json!({
                "room_id": room_id,
                "from": "BOB",
                "author_row_id": "bob",
                "content": "hi alice",
            }),
        )
        .await
        .unwrap();
    for inbox in [&alice_inbox, &bob_inbox] {
        let messages = inbox.named(events::CHAT_MESSAGE);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["message"], "hi alice");
        assert_eq!(messages[0]["from"], "BOB");
        assert_eq!(messages[0]["type"], "text");
    }
    let alice_rooms = alice_inbox.named(events::ROOMS_LIST);
    assert_eq!(alice_rooms[0][0]["unread_message_count"], 1);
    assert_eq!(alice_rooms[0][0]["last_message"], "hi alice");
    let bob_rooms = bob_inbox.named(events::ROOMS_LIST);
    assert_eq!(bob_rooms[0][0]["unread_message_count"], 0);

    // Alice reads; the room hears about it once.
    h.chat
        .on_message_read(&alice, json!({ "row_id": "alice", "room_id": room_id }))
        .await
        .unwrap();
    let receipts = bob_inbox.named(events::MESSAGE_READ_BROADCAST);
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0]["by"], "alice");
    assert_eq!(receipts[0]["room_id"], room_id.as_str());
    let alice_rooms = h
        .store
        .room_list(&RoomQuery {
            row_id: "alice".into(),
            kind: None,
            page: Page::default(),
        })
        .await
        .unwrap();
    assert_eq!(alice_rooms.rooms[0].unread_message_count, 0);

    h.chat
        .on_message_read(&alice, json!({ "row_id": "alice", "room_id": room_id }))
        .await
        .unwrap();
    assert_eq!(bob_inbox.named(events::MESSAGE_READ_BROADCAST).len(), 1);
    assert_eq!(alice_inbox.named(events::MESSAGE_READ_BROADCAST).len(), 1);
}

#[tokio::test]
async fn test_group_room_is_idempotent_per_item() {
    let h = Harness::new().await;
    let (socket, inbox) = h.connected("s1", "alice").await;
    let request = json!({
        "row_id": "alice",
        "project_id": "p1",
        "type": "group",
        "item_id": "task-42",
        "name": "Task 42",
        "member_attributes": { "role": "owner" },
    });

    h.chat.on_create_room(&socket, request.clone()).await.unwrap();
    assert!(inbox.named(events::CHECK_ROOM).is_empty());
    let room_id = h
        .store
        .room_id_by_item("p1", "task-42")
        .await
        .unwrap()
        .unwrap();

    h.chat.on_create_room(&socket, request).await.unwrap();
    assert_eq!(inbox.named(events::CHECK_ROOM), vec![json!(room_id)]);

    let members = h.store.members_by_room(&room_id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].attributes, json!({ "role": "owner" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_single_room_creates_one_room() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("chat.db"), 8)
        .await
        .unwrap();
    let h = Harness::with_store(store);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        let (socket, _) = h.socket(&format!("s{}", i));
        let chat = h.chat.clone();
        tasks.push(tokio::spawn(async move {
            chat.on_create_room(&socket, single_room(from, to)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for row_id in ["alice", "bob"] {
        let list = h
            .store
            .room_list(&RoomQuery {
                row_id: row_id.into(),
                kind: None,
                page: Page::default(),
            })
            .await
            .unwrap();
        assert_eq!(list.rooms.len(), 1, "{} sees one room", row_id);
        let members = h.store.members_by_room(&list.rooms[0].room.id).await.unwrap();
        assert_eq!(members.len(), 2);
    }
}

#[tokio::test]
async fn test_join_room_sends_history_and_subscribes() {
    let h = Harness::new().await;
    let (alice, _) = h.connected("s1", "alice").await;
    h.chat
        .on_create_room(&alice, single_room("alice", "bob"))
        .await
        .unwrap();
    let room_id = h
        .store
        .room_exists(&RoomLookup {
            kind: RoomKind::Single,
            project_id: "p1".into(),
            row_id: "alice".into(),
            to_row_id: Some("bob".into()),
            item_id: None,
        })
        .await
        .unwrap()
        .unwrap();

    let (bob, bob_inbox) = h.connected("s2", "bob").await;
    h.chat
        .on_join_room(&bob, json!({ "room_id": room_id, "row_id": "bob" }))
        .await
        .unwrap();
    assert!(bob_inbox.named(events::ROOM_HISTORY).is_empty());
    assert_eq!(h.registry.channel_size(&ChannelId::room(&room_id)), 1);

    for text in ["one", "two", "three"] {
        h.chat
            .on_chat_message(
                &alice,
                json!({ "room_id": room_id, "from": "ALICE", "author_row_id": "alice", "content": text }),
            )
            .await
            .unwrap();
    }
    bob_inbox.clear();

    h.chat
        .on_join_room(&bob, json!({ "room_id": room_id, "row_id": "bob", "limit": 2 }))
        .await
        .unwrap();
    let history = bob_inbox.named(events::ROOM_HISTORY);
    assert_eq!(history.len(), 1);
    let texts: Vec<&str> = history[0]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["message"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["two", "three"]);
}

#[tokio::test]
async fn test_missing_entities_are_not_found() {
    let h = Harness::new().await;
    let router = h.router();
    let (socket, inbox) = h.socket("s1");

    router
        .dispatch(
            socket.clone(),
            events::JOIN_ROOM,
            json!({ "room_id": "nope", "row_id": "alice" }),
        )
        .await;
    router
        .dispatch(socket.clone(), events::MESSAGE_UPDATE, json!({ "id": "nope" }))
        .await;
    router
        .dispatch(socket.clone(), events::PRESENCE_GET, json!({ "row_id": "ghost" }))
        .await;
    router
        .dispatch(
            socket.clone(),
            events::CHAT_MESSAGE,
            json!({ "room_id": "nope", "from": "ALICE", "author_row_id": "alice", "content": "hi" }),
        )
        .await;

    let messages: Vec<Value> = inbox
        .named(events::ERROR)
        .into_iter()
        .map(|e| e["message"].clone())
        .collect();
    assert_eq!(
        messages,
        vec![
            json!("room not found"),
            json!("message not found"),
            json!("presence not found"),
            json!("room not found"),
        ]
    );
    assert!(inbox.named(events::CHAT_MESSAGE).is_empty());
}

#[tokio::test]
async fn test_message_update_answers_requester_only() {
    let h = Harness::new().await;
    let (alice, alice_inbox) = h.connected("s1", "alice").await;
    let (bob, bob_inbox) = h.connected("s2", "bob").await;
    h.chat
        .on_create_room(&alice, single_room("alice", "bob"))
        .await
        .unwrap();
    let room_id = alice_inbox.named(events::ROOMS_LIST)[0][0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    for (socket, row_id) in [(&alice, "alice"), (&bob, "bob")] {
        h.chat
            .on_join_room(socket, json!({ "room_id": room_id, "row_id": row_id }))
            .await
            .unwrap();
    }
    h.chat
        .on_chat_message(
            &alice,
            json!({ "room_id": room_id, "from": "ALICE", "author_row_id": "alice", "content": "helo", "file": "a.png" }),
        )
        .await
        .unwrap();
    let message_id = alice_inbox.named(events::CHAT_MESSAGE)[0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    h.chat
        .on_message_update(&alice, json!({ "id": message_id, "content": "hello" }))
        .await
        .unwrap();

    let updates = alice_inbox.named(events::MESSAGE_UPDATED);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["message"], "hello");
    assert_eq!(updates[0]["file"], "a.png");
    assert!(bob_inbox.named(events::MESSAGE_UPDATED).is_empty());
}

#[tokio::test]
async fn test_presence_events() {
    let h = Harness::new().await;
    let router = h.router();
    let (socket, inbox) = h.socket("s1");
    let (_observer, observer_inbox) = h.socket("s2");

    router
        .dispatch(socket.clone(), events::PRESENCE_PING, json!({ "row_id": "alice" }))
        .await;
    assert_eq!(
        inbox.named(events::ERROR)[0]["message"],
        "row_id and project_id are required"
    );

    router
        .dispatch(
            socket.clone(),
            events::PRESENCE_PING,
            json!({ "row_id": "alice", "project_id": "p1" }),
        )
        .await;
    let published = observer_inbox.named(PRESENCE_UPDATED);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["project_id"], "p1");

    observer_inbox.clear();
    router
        .dispatch(socket.clone(), events::PRESENCE_GET, json!({ "row_id": "alice" }))
        .await;
    let answers = inbox.named(PRESENCE_UPDATED);
    assert_eq!(answers.last().unwrap()["status"], "online");
    assert!(observer_inbox.named(PRESENCE_UPDATED).is_empty());
}

#[tokio::test]
async fn test_transport_disconnect_keeps_other_sockets_online() {
    let h = Harness::new().await;
    let (first, _) = h.connected("s1", "alice").await;
    let (_second, _) = h.connected("s2", "alice").await;

    h.registry.remove_socket(first.id());
    h.chat
        .on_disconnected(&first, json!({ "row_id": "alice", "reason": "transport close" }))
        .await
        .unwrap();
    let presence = h.store.presence_get("alice").await.unwrap().unwrap();
    assert_eq!(presence.status, PresenceStatus::Online);

    // An explicit client event always marks the identity offline.
    h.chat
        .on_disconnected(&first, json!({ "row_id": "alice" }))
        .await
        .unwrap();
    let presence = h.store.presence_get("alice").await.unwrap().unwrap();
    assert_eq!(presence.status, PresenceStatus::Offline);
}

#[tokio::test]
async fn test_router_disconnect_marks_last_socket_offline() {
    use parley_transport::{CloseReason, EngineHandler};

    let h = Harness::new().await;
    let router = h.router();
    let (_socket, _) = h.connected("s1", "alice").await;

    router.on_close(&SessionId::new("s1"), CloseReason::PingTimeout).await;

    let presence = h.store.presence_get("alice").await.unwrap().unwrap();
    assert_eq!(presence.status, PresenceStatus::Offline);
    assert!(!h.registry.contains(&SessionId::new("s1")));
}

#[test]
fn test_storage_errors_hide_cause() {
    let err = ChatError::Storage {
        action: "load rooms",
        source: StoreError::Json(serde_json::from_str::<Value>("{\"secret\": ").unwrap_err()),
    };
    assert_eq!(err.client_message(), "failed to load rooms");
    assert_eq!(err.kind(), "storage");

    let timeout = ChatError::Storage {
        action: "send message",
        source: StoreError::Timeout(Duration::from_secs(5)),
    };
    assert!(timeout.client_message().starts_with("failed to send message"));
    assert!(!timeout.client_message().contains("5s"));
}
