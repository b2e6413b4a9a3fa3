//! HTTP surface: the engine endpoint (polling and WebSocket), health, and
//! the REST routes.

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parley_protocol::{codec, Frame, Version, PROTOCOL_VERSION};
use parley_store::ChatStore;
use parley_transport::upgrade::negotiate;
use parley_transport::{Engine, SessionId, TransportError, TransportKind, WebSocketConnection};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics::ConnectionMetricsGuard;
use crate::rest;

/// Shared server state.
pub struct AppState {
    /// The session engine.
    pub engine: Engine,
    /// Storage, for the REST routes.
    pub store: Arc<dyn ChatStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Deadline for REST storage calls.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let engine_path = state.config.transport.path.clone();
    Router::new()
        .route(&engine_path, get(engine_get).post(engine_post))
        .route("/health", get(health_handler))
        .nest("/v1", rest::routes())
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Query string of every engine request.
#[derive(Debug, Deserialize)]
pub struct EngineQuery {
    #[serde(rename = "EIO")]
    pub eio: Option<String>,
    pub transport: Option<String>,
    pub sid: Option<String>,
}

impl EngineQuery {
    fn transport(&self, enabled: &[TransportKind]) -> Result<TransportKind, Response> {
        let compatible = self
            .eio
            .as_deref()
            .and_then(Version::from_query)
            .is_some_and(|v| v.is_compatible_with(&PROTOCOL_VERSION));
        if !compatible {
            return Err(bad_request("Unsupported protocol version"));
        }

        let requested: TransportKind = self
            .transport
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|_| bad_request("Transport unknown"))?;
        negotiate(requested, enabled).map_err(transport_error)
    }

    fn session(&self) -> Option<SessionId> {
        self.sid.as_deref().map(SessionId::from)
    }
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn transport_error(err: TransportError) -> Response {
    let status = match &err {
        TransportError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        TransportError::UnknownSession(_)
        | TransportError::InvalidTransport(_)
        | TransportError::DuplicatePoll
        | TransportError::Protocol(_)
        | TransportError::ConnectionClosed => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(error = %err, status = status.as_u16(), "Engine request rejected");
    (status, err.to_string()).into_response()
}

fn payload_response(frames: &[Frame]) -> Response {
    match codec::encode_payload(frames) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            body,
        )
            .into_response(),
        Err(e) => transport_error(e.into()),
    }
}

/// `GET` on the engine path: polling handshake, long-poll, or WebSocket.
pub async fn engine_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EngineQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let kind = match query.transport(&state.engine.config().transports) {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    match (kind, query.session()) {
        (TransportKind::WebSocket, sid) => {
            let Some(ws) = ws else {
                return bad_request("Expected a WebSocket upgrade");
            };
            let engine = state.engine.clone();
            let max_payload = engine.config().max_payload;
            ws.max_message_size(max_payload)
                .on_upgrade(move |socket| async move {
                    let _metrics_guard = ConnectionMetricsGuard::new();
                    let conn = WebSocketConnection::new(socket, Some(remote.to_string()), max_payload);
                    if let Err(e) = engine.serve(sid, Box::new(conn)).await {
                        warn!(remote = %remote, error = %e, "WebSocket session failed");
                    }
                })
        }
        (TransportKind::Polling, None) => {
            let handshake = state.engine.open(TransportKind::Polling).await;
            debug!(session = %handshake.sid, remote = %remote, "Polling handshake");
            payload_response(&[Frame::open(handshake)])
        }
        (TransportKind::Polling, Some(sid)) => match state.engine.poll(&sid).await {
            Ok(frames) => payload_response(&frames),
            Err(e) => transport_error(e),
        },
    }
}

/// `POST` on the engine path: deliver a polling payload.
pub async fn engine_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EngineQuery>,
    body: String,
) -> Response {
    match query.transport(&state.engine.config().transports) {
        Ok(TransportKind::Polling) => {}
        Ok(TransportKind::WebSocket) => return bad_request("POST requires polling"),
        Err(response) => return response,
    }
    let Some(sid) = query.session() else {
        return bad_request("Session ID missing");
    };

    match state.engine.ingest_payload(&sid, &body).await {
        Ok(()) => (
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            "ok",
        )
            .into_response(),
        Err(e) => transport_error(e),
    }
}
