//! Room handlers.
//!
//! - `GET /rooms` - all live sessions
//! - `GET /rooms/{room}` - one session
//! - `POST /rooms/{room}/join` - join a voice channel
//! - `POST /rooms/{room}/play` - resolve a query and play it
//! - `POST /rooms/{room}/stop`
//! - `POST /rooms/{room}/volume`
//! - `DELETE /rooms/{room}` - halt and drop the session
//!
//! Request bodies are parsed by hand so malformed JSON gets a 400 with the
//! usual error body instead of axum's 422.

use crate::actors::SessionInfo;
use crate::errors::CnError;
use crate::media::TrackInfo;
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::types::{ChannelRef, Region, RoomId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub channel_id: String,
    pub region: Region,
}

#[derive(Debug, Deserialize)]
pub struct PlayRequest {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub volume: f64,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, CnError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "cn.handlers.rooms", error = %e, "Invalid request body");
        CnError::InvalidRequest("Invalid request body".to_string())
    })
}

pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionInfo>>, CnError> {
    Ok(Json(state.sessions.list().await?))
}

pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
) -> Result<Json<SessionInfo>, CnError> {
    Ok(Json(state.sessions.session(RoomId::from(room)).await?))
}

#[instrument(skip_all, name = "cn.admin.join", fields(room = %room))]
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionInfo>), CnError> {
    let request: JoinRequest = parse_body(&body)?;
    if request.channel_id.trim().is_empty() {
        return Err(CnError::InvalidRequest("channel_id is required".to_string()));
    }

    let channel = ChannelRef {
        room_id: RoomId::from(room),
        channel_id: request.channel_id,
        region: request.region,
    };

    info!(
        target: "cn.handlers.rooms",
        channel_id = %channel.channel_id,
        region = %channel.region,
        "Join requested"
    );
    let session = state.sessions.join(channel).await?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}

#[instrument(skip_all, name = "cn.admin.play", fields(room = %room))]
pub async fn play_in_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<TrackInfo>), CnError> {
    let request: PlayRequest = parse_body(&body)?;
    let track = state
        .sessions
        .play(RoomId::from(room), &request.query)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(track)))
}

pub async fn stop_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
) -> Result<StatusCode, CnError> {
    state.sessions.stop(RoomId::from(room)).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn set_room_volume(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CnError> {
    let request: VolumeRequest = parse_body(&body)?;
    state
        .sessions
        .set_volume(RoomId::from(room), request.volume)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip_all, name = "cn.admin.leave", fields(room = %room))]
pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
) -> Result<StatusCode, CnError> {
    state.sessions.leave(RoomId::from(room)).await?;
    info!(target: "cn.handlers.rooms", "Session left");
    Ok(StatusCode::NO_CONTENT)
}
