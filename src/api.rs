use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateStreamRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub stream_id: String,
    pub name: String,
}

#[derive(Serialize)]
pub struct StartHlsResponse {
    pub stream_key: String,
    pub playlist_url: String,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health_handler(State(state): State<Arc<crate::AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "hls_streams_active": state.transmuxer.stream_keys().len(),
        "sfu_streams_active": state.sfu.stream_infos().len(),
        "chat_rooms_active": state.chat.room_count(),
        "dvr_enabled": state.config.hls.dvr_enabled,
        "abr_enabled": state.config.hls.abr_enabled,
    }))
}

// ---------------------------------------------------------------------------
// SFU streams
// ---------------------------------------------------------------------------

pub async fn create_sfu_stream(
    State(state): State<Arc<crate::AppState>>,
    Json(body): Json<CreateStreamRequest>,
) -> Result<Json<crate::sfu::SfuStreamInfo>, ApiError> {
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let stream = state.sfu.create_stream(&id, &body.name)?;
    info!("API: SFU stream '{id}' created");
    Ok(Json(stream.info()))
}

pub async fn list_sfu_streams(
    State(state): State<Arc<crate::AppState>>,
) -> Json<Vec<crate::sfu::SfuStreamInfo>> {
    Json(state.sfu.stream_infos())
}

pub async fn get_sfu_stream(
    State(state): State<Arc<crate::AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<crate::sfu::SfuStreamInfo>, ApiError> {
    let stream = state.sfu.get_stream(&stream_id)?;
    Ok(Json(stream.info()))
}

pub async fn delete_sfu_stream(
    State(state): State<Arc<crate::AppState>>,
    Path(stream_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sfu.delete_stream(&stream_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Chat rooms
// ---------------------------------------------------------------------------

pub async fn create_chat_room(
    State(state): State<Arc<crate::AppState>>,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<crate::chat_room::RoomInfo>, ApiError> {
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let room = state.chat.create_room(&id, &body.stream_id, &body.name)?;
    info!("API: chat room '{id}' created");
    Ok(Json(room.info()))
}

pub async fn list_chat_rooms(
    State(state): State<Arc<crate::AppState>>,
) -> Json<Vec<crate::chat_room::RoomInfo>> {
    Json(state.chat.room_infos())
}

pub async fn delete_chat_room(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.chat.delete_room(&room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Moderation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ModerationRequest {
    /// Role of the caller performing the action.
    pub actor_role: crate::chat_room::Role,
    pub user_id: String,
    /// Mute duration in seconds (mute only).
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct ModerationStateResponse {
    pub banned: Vec<String>,
    pub muted: Vec<String>,
}

async fn apply_moderation(
    state: &crate::AppState,
    room_id: &str,
    action: crate::moderation::ModAction,
    body: ModerationRequest,
) -> Result<StatusCode, ApiError> {
    state.chat.moderate(
        room_id,
        body.actor_role,
        action,
        &body.user_id,
        body.duration_secs.map(std::time::Duration::from_secs),
    )?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ban_user(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<ModerationRequest>,
) -> Result<StatusCode, ApiError> {
    apply_moderation(&state, &room_id, crate::moderation::ModAction::Ban, body).await
}

pub async fn unban_user(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<ModerationRequest>,
) -> Result<StatusCode, ApiError> {
    apply_moderation(&state, &room_id, crate::moderation::ModAction::Unban, body).await
}

pub async fn mute_user(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<ModerationRequest>,
) -> Result<StatusCode, ApiError> {
    apply_moderation(&state, &room_id, crate::moderation::ModAction::Mute, body).await
}

pub async fn unmute_user(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
    Json(body): Json<ModerationRequest>,
) -> Result<StatusCode, ApiError> {
    apply_moderation(&state, &room_id, crate::moderation::ModAction::Unmute, body).await
}

pub async fn get_moderation_state(
    State(state): State<Arc<crate::AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<ModerationStateResponse>, ApiError> {
    state.chat.get_room(&room_id)?;
    Ok(Json(ModerationStateResponse {
        banned: state.chat.moderator().banned_users(&room_id),
        muted: state.chat.moderator().muted_users(&room_id),
    }))
}

// ---------------------------------------------------------------------------
// HLS stream control
// ---------------------------------------------------------------------------

pub async fn start_hls_stream(
    State(state): State<Arc<crate::AppState>>,
    Path(stream_key): Path<String>,
) -> Result<Json<StartHlsResponse>, ApiError> {
    state.transmuxer.start_stream(&stream_key)?;
    Ok(Json(StartHlsResponse {
        playlist_url: format!("/{stream_key}/playlist.m3u8"),
        stream_key,
    }))
}

pub async fn stop_hls_stream(
    State(state): State<Arc<crate::AppState>>,
    Path(stream_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.transmuxer.stop_stream(&stream_key)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_hls_stream(
    State(state): State<Arc<crate::AppState>>,
    Path(stream_key): Path<String>,
) -> Result<Json<crate::transmuxer::StreamInfo>, ApiError> {
    let info = state.transmuxer.stream_info(&stream_key)?;
    Ok(Json(info))
}
