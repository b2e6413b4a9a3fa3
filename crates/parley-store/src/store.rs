//! The storage interface used by the chat layer.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::models::{
    MarkRead, Message, MessageEdit, MessageList, NewMember, NewMessage, NewRoom, Page, Presence,
    PresenceStatus, Room, RoomCreated, RoomList, RoomLookup, RoomMember, RoomQuery,
};

/// Relational persistence for rooms, memberships, messages and presence.
///
/// Times are Unix milliseconds supplied by the caller wherever the result of
/// the call depends on "now".
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert a room. If the uniqueness guard already holds an equivalent
    /// room, that room is returned with `created = false`.
    async fn room_create(&self, room: &NewRoom) -> Result<RoomCreated>;

    /// Fetch a room by id.
    async fn room_get(&self, id: &str) -> Result<Option<Room>>;

    /// List a member's rooms, most recently active first.
    async fn room_list(&self, query: &RoomQuery) -> Result<RoomList>;

    /// Find the id of a room matching `lookup`.
    async fn room_exists(&self, lookup: &RoomLookup) -> Result<Option<String>>;

    /// Find a project-scoped room by item id.
    async fn room_id_by_item(&self, project_id: &str, item_id: &str) -> Result<Option<String>>;

    /// Add a membership. Returns `false` if it already existed.
    async fn member_add(&self, member: &NewMember) -> Result<bool>;

    /// All memberships of a room.
    async fn members_by_room(&self, room_id: &str) -> Result<Vec<RoomMember>>;

    /// Record that `row_id` has read `room_id` up to `at`.
    async fn member_touch_read(&self, room_id: &str, row_id: &str, at: i64) -> Result<()>;

    /// Insert a message and bump the room's activity time.
    async fn message_create(&self, message: &NewMessage) -> Result<Message>;

    /// Newest `page.limit` messages after `page.offset`, returned oldest first.
    async fn message_list(&self, room_id: &str, page: Page) -> Result<MessageList>;

    /// Apply a partial update. `None` if the message does not exist.
    async fn message_update(&self, edit: &MessageEdit) -> Result<Option<Message>>;

    /// Stamp every unread message in the room not authored by `reader`.
    async fn message_mark_read(&self, room_id: &str, reader: &str, at: i64) -> Result<MarkRead>;

    /// Set an identity's status and last-seen time.
    async fn presence_upsert(&self, row_id: &str, status: PresenceStatus, at: i64)
        -> Result<Presence>;

    /// Mark an identity online, remembering the project it was last seen in.
    async fn presence_heartbeat(
        &self,
        row_id: &str,
        project_id: Option<&str>,
        at: i64,
    ) -> Result<Presence>;

    /// Fetch an identity's presence.
    async fn presence_get(&self, row_id: &str) -> Result<Option<Presence>>;

    /// Flip every non-offline identity last seen before `cutoff` to offline,
    /// returning the flipped identities.
    async fn presence_sweep(&self, cutoff: i64) -> Result<Vec<String>>;
}

/// Run a storage call with a deadline.
///
/// # Errors
///
/// Returns `StoreError::Timeout` if `fut` does not finish within `timeout`,
/// otherwise whatever the call returned.
pub async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        };
        let err = with_deadline(Duration::from_secs(5), slow).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let value = with_deadline(Duration::from_secs(5), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
