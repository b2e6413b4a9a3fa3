//! Chat data models.
//!
//! Timestamps are stored as Unix milliseconds and rendered as RFC 3339
//! strings when serialized for clients.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use sqlx::FromRow;

/// Default page size when none (or zero) is requested.
pub const DEFAULT_LIMIT: u64 = 10;

/// Largest page size a caller may request.
pub const MAX_LIMIT: u64 = 100;

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render Unix milliseconds as an RFC 3339 UTC timestamp.
#[must_use]
pub fn to_rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn rfc3339<S: Serializer>(millis: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&to_rfc3339(*millis))
}

fn rfc3339_opt<S: Serializer>(millis: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
    match millis {
        Some(m) => s.serialize_str(&to_rfc3339(*m)),
        None => s.serialize_none(),
    }
}

/// Room type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RoomKind {
    /// A 1:1 conversation between two identities.
    Single,
    /// A conversation keyed by (project, item).
    Group,
}

impl RoomKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Single => "single",
            RoomKind::Group => "group",
        }
    }
}

impl std::fmt::Display for RoomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoomKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(RoomKind::Single),
            "group" => Ok(RoomKind::Group),
            _ => Err(format!("unknown room type: {}", s)),
        }
    }
}

/// Presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    /// Build a page from client input: `limit` 0 or absent means the
    /// default, anything above the ceiling is capped.
    #[must_use]
    pub fn clamped(offset: Option<u64>, limit: Option<u64>) -> Self {
        let limit = match limit.unwrap_or(0) {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        };
        Self {
            offset: offset.unwrap_or(0),
            limit,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::clamped(None, None)
    }
}

/// A chat room.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: RoomKind,
    pub project_id: String,
    pub item_id: Option<String>,
    #[serde(serialize_with = "rfc3339")]
    pub created_at: i64,
    #[serde(serialize_with = "rfc3339")]
    pub updated_at: i64,
}

/// A room as seen by one member in their room list.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct RoomSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub room: Room,
    /// Display name of the counterpart, from the viewer's membership.
    pub to_name: String,
    pub to_row_id: Option<String>,
    #[sqlx(json)]
    pub attributes: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_from: Option<String>,
    #[serde(serialize_with = "rfc3339_opt")]
    pub last_message_created_at: Option<i64>,
    pub unread_message_count: i64,
    /// Counterpart presence, when the room has a counterpart.
    pub user_presence_status: Option<PresenceStatus>,
    #[serde(rename = "user_presence_last_seen", serialize_with = "rfc3339_opt")]
    pub user_presence_last_seen_at: Option<i64>,
}

/// One page of a member's rooms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomList {
    /// Total rooms across all pages.
    pub count: u64,
    pub rooms: Vec<RoomSummary>,
}

/// Input for creating a room.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub kind: RoomKind,
    pub project_id: String,
    pub item_id: Option<String>,
    /// Creator identity.
    pub row_id: String,
    /// Peer identity; required for single rooms.
    pub to_row_id: Option<String>,
}

impl NewRoom {
    /// Order-independent key for the identity pair of a single room.
    #[must_use]
    pub fn pair_key(&self) -> Option<String> {
        match (self.kind, self.to_row_id.as_deref()) {
            (RoomKind::Single, Some(peer)) => Some(pair_key(&self.row_id, peer)),
            _ => None,
        }
    }
}

/// Order-independent key for two identities.
#[must_use]
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}\u{1f}{b}")
    } else {
        format!("{b}\u{1f}{a}")
    }
}

/// Outcome of a create call that may resolve to an existing room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomCreated {
    pub room: Room,
    /// `false` when an equivalent room already existed.
    pub created: bool,
}

/// Criteria for finding an existing room.
#[derive(Debug, Clone)]
pub struct RoomLookup {
    pub kind: RoomKind,
    pub project_id: String,
    pub row_id: String,
    pub to_row_id: Option<String>,
    pub item_id: Option<String>,
}

/// Criteria for listing a member's rooms.
#[derive(Debug, Clone)]
pub struct RoomQuery {
    pub row_id: String,
    pub kind: Option<RoomKind>,
    pub page: Page,
}

/// A room membership.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct RoomMember {
    pub id: String,
    pub room_id: String,
    pub row_id: String,
    pub to_name: String,
    pub to_row_id: Option<String>,
    #[sqlx(json)]
    pub attributes: Value,
    #[serde(serialize_with = "rfc3339_opt")]
    pub last_read_at: Option<i64>,
    #[serde(serialize_with = "rfc3339")]
    pub created_at: i64,
    #[serde(serialize_with = "rfc3339")]
    pub updated_at: i64,
}

/// Input for adding a membership.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub room_id: String,
    pub row_id: String,
    pub to_name: String,
    pub to_row_id: Option<String>,
    pub attributes: Value,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub message: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: String,
    pub file: String,
    pub author_row_id: String,
    #[serde(rename = "from")]
    pub from_name: String,
    pub parent_id: Option<String>,
    #[serde(serialize_with = "rfc3339")]
    pub created_at: i64,
    #[serde(serialize_with = "rfc3339")]
    pub updated_at: i64,
    #[serde(serialize_with = "rfc3339_opt")]
    pub read_at: Option<i64>,
}

/// One page of a room's history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageList {
    /// Total messages in the room.
    pub count: u64,
    pub messages: Vec<Message>,
}

/// Input for posting a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub message: String,
    pub kind: String,
    pub file: String,
    pub author_row_id: String,
    pub from_name: String,
    pub parent_id: Option<String>,
}

/// A partial message update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct MessageEdit {
    pub id: String,
    pub message: Option<String>,
    pub file: Option<String>,
    pub kind: Option<String>,
}

/// Outcome of a bulk read-receipt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkRead {
    pub room_id: String,
    #[serde(serialize_with = "rfc3339")]
    pub read_at: i64,
    /// Whether any message was stamped.
    pub updated: bool,
}

/// Presence of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Presence {
    pub row_id: String,
    pub status: PresenceStatus,
    #[serde(serialize_with = "rfc3339")]
    pub last_seen_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}
