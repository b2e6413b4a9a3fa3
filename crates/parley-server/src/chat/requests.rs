//! Typed client requests, one per event.
//!
//! Every payload goes through [`decode`]: it must be a JSON object, it must
//! deserialize into the request type, and the request's own `validate` must
//! accept it. Empty strings count as missing.

use parley_store::{Page, RoomKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::ChatError;

/// A request decoded from an event payload.
pub trait Request: DeserializeOwned {
    /// Check required fields and field formats.
    fn validate(&self) -> Result<(), ChatError>;
}

/// Decode and validate an event payload.
pub fn decode<T: Request>(payload: Value) -> Result<T, ChatError> {
    if !payload.is_object() {
        return Err(ChatError::validation("invalid payload"));
    }
    let request: T = serde_json::from_value(payload)
        .map_err(|e| ChatError::Validation(format!("invalid payload: {}", e)))?;
    request.validate()?;
    Ok(request)
}

fn present(value: &str) -> bool {
    !value.trim().is_empty()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| present(v)).map(str::to_string)
}

fn require(ok: bool, message: &'static str) -> Result<(), ChatError> {
    if ok {
        Ok(())
    } else {
        Err(ChatError::validation(message))
    }
}

/// Parse an optional room type filter. Absent or empty means no filter.
fn kind_filter(kind: &Option<String>) -> Result<Option<RoomKind>, ChatError> {
    match non_empty(kind) {
        None => Ok(None),
        Some(kind) => kind
            .parse()
            .map(Some)
            .map_err(|_| ChatError::validation("type must be single or group")),
    }
}

/// Accept an attribute value given as an object or as a string holding a
/// JSON object.
fn attributes_from(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => Some(parsed),
            _ => None,
        },
        _ => None,
    }
}

fn empty_attributes() -> Value {
    Value::Object(Map::new())
}

/// Pagination fields shared by list-returning events.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl Paging {
    /// The clamped page window.
    #[must_use]
    pub fn page(&self) -> Page {
        Page::clamped(self.offset, self.limit)
    }
}

/// `connected` and `rooms list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomsRequest {
    #[serde(default)]
    pub row_id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub paging: Paging,
}

impl RoomsRequest {
    pub fn kind_filter(&self) -> Result<Option<RoomKind>, ChatError> {
        kind_filter(&self.kind)
    }
}

impl Request for RoomsRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(present(&self.row_id), "row_id is required")?;
        self.kind_filter().map(|_| ())
    }
}

/// `create room`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub row_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub to_row_id: Option<String>,
    #[serde(default)]
    pub to_name: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub member_attributes: Value,
    #[serde(default)]
    pub to_member_attributes: Value,
    #[serde(flatten)]
    pub paging: Paging,
}

impl CreateRoomRequest {
    /// The requested room type. Only meaningful after validation.
    pub fn room_kind(&self) -> Result<RoomKind, ChatError> {
        self.kind
            .parse()
            .map_err(|_| ChatError::validation("type must be single or group"))
    }

    pub fn peer(&self) -> Option<String> {
        non_empty(&self.to_row_id)
    }

    pub fn peer_display_name(&self) -> Option<String> {
        non_empty(&self.from_name)
    }

    pub fn item(&self) -> Option<String> {
        non_empty(&self.item_id)
    }

    /// Attributes of the creator's membership: `member_attributes`, else
    /// `attributes`, else an empty object.
    #[must_use]
    pub fn member_attributes(&self) -> Value {
        attributes_from(&self.member_attributes)
            .or_else(|| attributes_from(&self.attributes))
            .unwrap_or_else(empty_attributes)
    }

    /// Attributes of the peer's membership in a single room.
    #[must_use]
    pub fn peer_attributes(&self) -> Value {
        attributes_from(&self.to_member_attributes).unwrap_or_else(empty_attributes)
    }
}

impl Request for CreateRoomRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(
            present(&self.row_id) && present(&self.project_id) && present(&self.kind),
            "row_id, project_id and type are required",
        )?;
        if self.room_kind()? == RoomKind::Single {
            require(self.peer().is_some(), "to_row_id is required for single rooms")?;
        }
        Ok(())
    }
}

/// `join room`.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRoomRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub row_id: String,
    #[serde(default)]
    pub to_name: String,
    #[serde(default)]
    pub to_row_id: Option<String>,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub paging: Paging,
}

impl JoinRoomRequest {
    pub fn kind_filter(&self) -> Result<Option<RoomKind>, ChatError> {
        kind_filter(&self.kind)
    }

    pub fn peer(&self) -> Option<String> {
        non_empty(&self.to_row_id)
    }

    #[must_use]
    pub fn member_attributes(&self) -> Value {
        attributes_from(&self.attributes).unwrap_or_else(empty_attributes)
    }
}

impl Request for JoinRoomRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(
            present(&self.room_id) && present(&self.row_id),
            "room_id and row_id are required",
        )?;
        self.kind_filter().map(|_| ())
    }
}

/// `room history`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomHistoryRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(flatten)]
    pub paging: Paging,
}

impl Request for RoomHistoryRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(present(&self.room_id), "room_id is required")
    }
}

/// `chat message`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub author_row_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub paging: Paging,
}

impl ChatMessageRequest {
    /// Message type, `text` unless given.
    #[must_use]
    pub fn message_kind(&self) -> String {
        non_empty(&self.kind).unwrap_or_else(|| "text".to_string())
    }

    pub fn parent(&self) -> Option<String> {
        non_empty(&self.parent_id)
    }
}

impl Request for ChatMessageRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(
            present(&self.room_id) && present(&self.from) && present(&self.author_row_id),
            "room_id, from and author_row_id are required",
        )
    }
}

/// `message:read`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReadRequest {
    #[serde(default)]
    pub row_id: String,
    #[serde(default)]
    pub room_id: String,
}

impl Request for MessageReadRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(
            present(&self.row_id) && present(&self.room_id),
            "row_id and room_id are required",
        )
    }
}

/// `message:update`. Absent fields keep their stored value.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageUpdateRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Request for MessageUpdateRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(present(&self.id), "id is required")
    }
}

/// `presence:connected` and `presence:get`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityRequest {
    #[serde(default)]
    pub row_id: String,
}

impl Request for IdentityRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(present(&self.row_id), "row_id is required")
    }
}

/// `presence:ping`.
#[derive(Debug, Clone, Deserialize)]
pub struct PresencePingRequest {
    #[serde(default)]
    pub row_id: String,
    #[serde(default)]
    pub project_id: String,
}

impl Request for PresencePingRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(
            present(&self.row_id) && present(&self.project_id),
            "row_id and project_id are required",
        )
    }
}

/// `disconnected`. The router adds `reason` when a transport went away.
#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectedRequest {
    #[serde(default)]
    pub row_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Request for DisconnectedRequest {
    fn validate(&self) -> Result<(), ChatError> {
        require(present(&self.row_id), "row_id is required")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_object_payload_rejected() {
        for payload in [Value::Null, json!("alice"), json!([1, 2])] {
            let err = decode::<RoomsRequest>(payload).unwrap_err();
            assert_eq!(err.client_message(), "invalid payload");
        }
    }

    #[test]
    fn test_missing_and_empty_fields_rejected() {
        let err = decode::<RoomsRequest>(json!({})).unwrap_err();
        assert_eq!(err.client_message(), "row_id is required");

        let err = decode::<MessageReadRequest>(json!({"row_id": "alice", "room_id": ""}))
            .unwrap_err();
        assert_eq!(err.client_message(), "row_id and room_id are required");
    }

    #[test]
    fn test_paging_is_clamped() {
        let req: RoomsRequest =
            decode(json!({"row_id": "alice", "offset": 20, "limit": 500})).unwrap();
        assert_eq!(req.paging.page(), Page { offset: 20, limit: 100 });

        let req: RoomsRequest = decode(json!({"row_id": "alice", "limit": 0})).unwrap();
        assert_eq!(req.paging.page().limit, 10);
    }

    #[test]
    fn test_type_filter() {
        let req: RoomsRequest = decode(json!({"row_id": "alice", "type": ""})).unwrap();
        assert_eq!(req.kind_filter().unwrap(), None);

        let req: RoomsRequest = decode(json!({"row_id": "alice", "type": "group"})).unwrap();
        assert_eq!(req.kind_filter().unwrap(), Some(RoomKind::Group));

        assert!(decode::<RoomsRequest>(json!({"row_id": "alice", "type": "channel"})).is_err());
    }

    #[test]
    fn test_single_room_needs_peer() {
        let err = decode::<CreateRoomRequest>(json!({
            "row_id": "alice", "project_id": "p1", "type": "single"
        }))
        .unwrap_err();
        assert_eq!(err.client_message(), "to_row_id is required for single rooms");

        let ok = decode::<CreateRoomRequest>(json!({
            "row_id": "alice", "project_id": "p1", "type": "group", "item_id": "task-9"
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_member_attribute_fallback() {
        let base = json!({"row_id": "a", "project_id": "p", "type": "single", "to_row_id": "b"});

        let mut with_both = base.clone();
        with_both["member_attributes"] = json!({"role": "owner"});
        with_both["attributes"] = json!({"role": "guest"});
        let req: CreateRoomRequest = decode(with_both).unwrap();
        assert_eq!(req.member_attributes(), json!({"role": "owner"}));

        let mut as_string = base.clone();
        as_string["attributes"] = json!("{\"color\":\"red\"}");
        let req: CreateRoomRequest = decode(as_string).unwrap();
        assert_eq!(req.member_attributes(), json!({"color": "red"}));

        let mut invalid = base.clone();
        invalid["member_attributes"] = json!("not json");
        let req: CreateRoomRequest = decode(invalid).unwrap();
        assert_eq!(req.member_attributes(), json!({}));
        assert_eq!(req.peer_attributes(), json!({}));
    }

    #[test]
    fn test_message_defaults() {
        let req: ChatMessageRequest = decode(json!({
            "room_id": "r1", "from": "Alice", "author_row_id": "alice", "parent_id": ""
        }))
        .unwrap();
        assert_eq!(req.message_kind(), "text");
        assert_eq!(req.parent(), None);
        assert_eq!(req.content, "");
    }
}
