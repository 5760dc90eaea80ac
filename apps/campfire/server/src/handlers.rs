use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use campfire_core::{RoomId, RoomPhase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::session;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomStatusResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RoomPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// POST /rooms - Create a room. Issues a join code when no passphrase is
/// supplied; members then join over the WebSocket with that code.
pub async fn create_room(
    State(state): State<AppState>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, StatusCode> {
    let supplied = payload.passphrase.filter(|p| !p.trim().is_empty());
    let passphrase = match supplied {
        Some(p) => session::normalize_passphrase(&p),
        None => session::normalize_passphrase(&session::generate_join_code()),
    };
    let hash = session::hash_passphrase(&passphrase);

    match state.store.find_room(&hash).await {
        Ok(Some(_)) => {
            return Ok(Json(CreateRoomResponse {
                success: false,
                message: Some("room already exists".to_string()),
                room_id: None,
                join_code: None,
                websocket_url: None,
            }));
        }
        Ok(None) => {}
        Err(err) => {
            error!(%err, "failed to check room existence");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match state.store.create_room(&hash).await {
        Ok(room) => {
            debug!(room = %room.id, "room created");
            Ok(Json(CreateRoomResponse {
                success: true,
                message: None,
                room_id: Some(room.id),
                join_code: Some(passphrase),
                websocket_url: state.public_url.as_deref().map(websocket_url),
            }))
        }
        Err(err) => {
            error!(%err, "failed to create room");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /rooms/{passphrase} - Probe whether a room exists.
pub async fn room_status(
    State(state): State<AppState>,
    Path(passphrase): Path<String>,
) -> Result<Json<RoomStatusResponse>, StatusCode> {
    let hash = session::hash_passphrase(&session::normalize_passphrase(&passphrase));

    match state.store.find_room(&hash).await {
        Ok(Some(room)) => {
            let members = state
                .store
                .snapshot(room.id)
                .await
                .ok()
                .flatten()
                .map(|snapshot| snapshot.members.len());
            Ok(Json(RoomStatusResponse {
                exists: true,
                phase: Some(room.phase),
                members,
                created_at: Some(room.created_at.unix_timestamp()),
            }))
        }
        Ok(None) => Ok(Json(RoomStatusResponse {
            exists: false,
            phase: None,
            members: None,
            created_at: None,
        })),
        Err(err) => {
            error!(%err, "failed to get room status");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn websocket_url(base_http: &str) -> String {
    let trimmed = base_http.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", trimmed)
    };
    format!("{}/ws", ws_base)
}
