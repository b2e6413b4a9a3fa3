//! The `/v1` REST routes.
//!
//! Every response is an envelope `{body, error}`: `body` on success,
//! `error` with a 400, 404 or 500 status otherwise.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parley_store::{
    with_deadline, NewMember, NewRoom, Page, RoomKind, RoomLookup, RoomQuery, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use crate::chat::requests::{decode, CreateRoomRequest};
use crate::chat::ChatError;
use crate::http::AppState;

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub body: Option<T>,
    pub error: String,
}

impl<T: Serialize> Envelope<T> {
    fn ok(status: StatusCode, body: T) -> Response {
        (
            status,
            Json(Envelope {
                body: Some(body),
                error: String::new(),
            }),
        )
            .into_response()
    }
}

/// A failed REST call.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Storage(StoreError),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Validation(message) => ApiError::BadRequest(message),
            ChatError::NotFound(what) => ApiError::NotFound(what),
            ChatError::Storage { source, .. } => ApiError::Storage(source),
            ChatError::Encode(e) => ApiError::Storage(StoreError::Json(e)),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Storage(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => {
                debug!(error = %message, "Rejected REST request");
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Storage(e) => {
                error!(error = %e, "REST storage call failed");
                let message = if e.is_timeout() {
                    "storage is busy, try again"
                } else {
                    "internal storage error"
                };
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
        };
        (
            status,
            Json(Envelope::<()> {
                body: None,
                error: message,
            }),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Routes mounted under `/v1`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/room", post(room_create).get(room_list))
        .route("/room/exist", post(room_exists))
        .route("/room/:item_id", get(room_id_by_item))
        .route("/room-member", post(room_member_create))
        .route("/message", get(message_list))
}

async fn call<T, F>(state: &AppState, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = parley_store::Result<T>>,
{
    Ok(with_deadline(state.call_timeout(), fut).await?)
}

fn required(value: &Option<String>, message: &str) -> Result<String, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(message.to_string()))
}

fn room_kind(kind: &Option<String>) -> Result<Option<RoomKind>, ApiError> {
    match kind.as_deref().filter(|k| !k.is_empty()) {
        None => Ok(None),
        Some(kind) => kind
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest("type must be single or group".into())),
    }
}

/// `POST /v1/room`: create a room with the creator's membership, and the
/// peer's for a single room when `from_name` is given.
async fn room_create(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(payload) = payload?;
    let req: CreateRoomRequest = decode(payload)?;
    let kind = req.room_kind()?;

    let new_room = NewRoom {
        name: req.name.clone(),
        kind,
        project_id: req.project_id.clone(),
        item_id: req.item(),
        row_id: req.row_id.clone(),
        to_row_id: req.peer(),
    };
    let outcome = call(&state, state.store.room_create(&new_room)).await?;
    let room_id = outcome.room.id.clone();

    let creator = NewMember {
        room_id: room_id.clone(),
        row_id: req.row_id.clone(),
        to_name: req.to_name.clone(),
        to_row_id: req.peer(),
        attributes: req.member_attributes(),
    };
    call(&state, state.store.member_add(&creator)).await?;

    if kind == RoomKind::Single {
        if let (Some(peer), Some(from_name)) = (req.peer(), req.peer_display_name()) {
            let reciprocal = NewMember {
                room_id,
                row_id: peer,
                to_name: from_name,
                to_row_id: Some(req.row_id.clone()),
                attributes: req.peer_attributes(),
            };
            call(&state, state.store.member_add(&reciprocal)).await?;
        }
    }

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(Envelope::ok(status, outcome.room))
}

#[derive(Debug, Deserialize)]
struct RoomListQuery {
    row_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    offset: Option<u64>,
    limit: Option<u64>,
}

/// `GET /v1/room`.
async fn room_list(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RoomListQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let room_query = RoomQuery {
        row_id: required(&query.row_id, "row_id is required")?,
        kind: room_kind(&query.kind)?,
        page: Page::clamped(query.offset, query.limit),
    };
    let rooms = call(&state, state.store.room_list(&room_query)).await?;
    Ok(Envelope::ok(StatusCode::OK, rooms))
}

#[derive(Debug, Deserialize)]
struct RoomExistsBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    project_id: Option<String>,
    row_id: Option<String>,
    to_row_id: Option<String>,
    item_id: Option<String>,
}

/// `POST /v1/room/exist`: the matching room id, or `null`.
async fn room_exists(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RoomExistsBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let kind = room_kind(&body.kind)?
        .ok_or_else(|| ApiError::BadRequest("type is required".into()))?;
    let lookup = RoomLookup {
        kind,
        project_id: required(&body.project_id, "project_id is required")?,
        row_id: required(&body.row_id, "row_id is required")?,
        to_row_id: body.to_row_id.filter(|v| !v.is_empty()),
        item_id: body.item_id.filter(|v| !v.is_empty()),
    };
    let id = call(&state, state.store.room_exists(&lookup)).await?;
    Ok(Envelope::ok(StatusCode::OK, id))
}

#[derive(Debug, Deserialize)]
struct ProjectQuery {
    project_id: Option<String>,
}

/// `GET /v1/room/:item_id?project_id=`.
async fn room_id_by_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let project_id = required(&query.project_id, "project_id is required")?;
    let id = call(&state, state.store.room_id_by_item(&project_id, &item_id))
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    Ok(Envelope::ok(StatusCode::OK, id))
}

#[derive(Debug, Deserialize)]
struct RoomMemberBody {
    room_id: Option<String>,
    row_id: Option<String>,
    #[serde(default)]
    to_name: String,
    to_row_id: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

/// `POST /v1/room-member`: idempotent membership insert.
async fn room_member_create(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RoomMemberBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = payload?;
    let member = NewMember {
        room_id: required(&body.room_id, "room_id is required")?,
        row_id: required(&body.row_id, "row_id is required")?,
        to_name: body.to_name,
        to_row_id: body.to_row_id.filter(|v| !v.is_empty()),
        attributes: body
            .attributes
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({})),
    };
    call(&state, state.store.room_get(&member.room_id))
        .await?
        .ok_or(ApiError::NotFound("room"))?;

    let created = call(&state, state.store.member_add(&member)).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(Envelope::ok(
        status,
        json!({ "room_id": member.room_id, "row_id": member.row_id, "created": created }),
    ))
}

#[derive(Debug, Deserialize)]
struct MessageListQuery {
    room_id: Option<String>,
    offset: Option<u64>,
    limit: Option<u64>,
}

/// `GET /v1/message`.
async fn message_list(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MessageListQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let room_id = required(&query.room_id, "room_id is required")?;
    let page = Page::clamped(query.offset, query.limit);
    let messages = call(&state, state.store.message_list(&room_id, page)).await?;
    Ok(Envelope::ok(StatusCode::OK, messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::state;

    async fn envelope(response: Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn room_body() -> Value {
        json!({
            "row_id": "alice",
            "project_id": "p1",
            "type": "single",
            "to_row_id": "bob",
            "to_name": "Bob",
            "from_name": "Alice",
        })
    }

    #[tokio::test]
    async fn test_room_create_is_idempotent() {
        let state = state().await;

        let first = room_create(State(state.clone()), Ok(Json(room_body()))).await.unwrap();
        let (status, first) = envelope(first).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["error"], "");
        assert_eq!(first["body"]["type"], "single");

        let again = room_create(State(state.clone()), Ok(Json(room_body()))).await.unwrap();
        let (status, again) = envelope(again).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["body"]["id"], first["body"]["id"]);

        let room_id = first["body"]["id"].as_str().unwrap();
        assert_eq!(state.store.members_by_room(room_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_maps_to_400() {
        let state = state().await;

        let err = room_create(State(state.clone()), Ok(Json(json!({"row_id": "alice"}))))
            .await
            .unwrap_err();
        let (status, body) = envelope(err.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["body"], Value::Null);
        assert_eq!(body["error"], "row_id, project_id and type are required");

        let query = RoomListQuery {
            row_id: None,
            kind: None,
            offset: None,
            limit: None,
        };
        let err = room_list(State(state.clone()), Ok(Query(query))).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "row_id is required"));
    }

    #[tokio::test]
    async fn test_room_lookup_by_item() {
        let state = state().await;
        let group = json!({
            "row_id": "alice",
            "project_id": "p1",
            "type": "group",
            "item_id": "task-7",
            "to_row_id": "bob",
            "from_name": "Alice",
        });
        let created = room_create(State(state.clone()), Ok(Json(group))).await.unwrap();
        let (_, created) = envelope(created).await;
        let group_id = created["body"]["id"].as_str().unwrap();
        let members = state.store.members_by_room(group_id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].row_id, "alice");

        let found = room_id_by_item(
            State(state.clone()),
            Path("task-7".to_string()),
            Ok(Query(ProjectQuery {
                project_id: Some("p1".into()),
            })),
        )
        .await
        .unwrap();
        let (status, body) = envelope(found).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["body"].is_string());

        let missing = room_id_by_item(
            State(state.clone()),
            Path("task-8".to_string()),
            Ok(Query(ProjectQuery {
                project_id: Some("p1".into()),
            })),
        )
        .await
        .unwrap_err();
        let (status, body) = envelope(missing.into_response()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "room not found");
    }

    #[tokio::test]
    async fn test_room_exists_and_members() {
        let state = state().await;
        let created = room_create(State(state.clone()), Ok(Json(room_body()))).await.unwrap();
        let (_, created) = envelope(created).await;
        let room_id = created["body"]["id"].as_str().unwrap().to_string();

        let lookup = RoomExistsBody {
            kind: Some("single".into()),
            project_id: Some("p1".into()),
            row_id: Some("bob".into()),
            to_row_id: Some("alice".into()),
            item_id: None,
        };
        let (_, exists) = envelope(
            room_exists(State(state.clone()), Ok(Json(lookup)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(exists["body"], room_id.as_str());

        let member = RoomMemberBody {
            room_id: Some(room_id.clone()),
            row_id: Some("carol".into()),
            to_name: "Carol".into(),
            to_row_id: None,
            attributes: None,
        };
        let (status, body) = envelope(
            room_member_create(State(state.clone()), Ok(Json(member)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["body"]["created"], true);

        let query = MessageListQuery {
            room_id: Some(room_id),
            offset: None,
            limit: Some(500),
        };
        let (status, body) = envelope(
            message_list(State(state.clone()), Ok(Query(query)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["body"]["count"], 0);
    }
}
