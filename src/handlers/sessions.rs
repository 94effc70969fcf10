//! # Session Query Surface
//!
//! Read-only HTTP endpoints over the registry and the segment store, plus
//! the explicit purge. These observe the relay; nothing here can pair,
//! forward, or tear down a live call.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /session_files/{session_id}` — segment metadata for one session,
/// oldest first. An unknown session is an empty list, not a 404: the caller
/// cannot distinguish "never existed" from "nothing flushed yet".
pub async fn list_session_files(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let segments = state.registry.store().list_session(&session_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "file_count": segments.len(),
        "files": segments
    })))
}

/// `GET /audio/{session_id}` — both directions of a session's recorded
/// audio, as ordered segment lists per role. 404 when nothing has been
/// persisted for the session at all.
pub async fn session_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let segments = state.registry.store().list_session(&session_id)?;

    if segments.is_empty() {
        return Err(AppError::NotFound(format!(
            "No audio segments for session {}",
            session_id
        )));
    }

    let client_marker = format!("{}_client_", session_id);
    let (client, operator): (Vec<_>, Vec<_>) = segments
        .into_iter()
        .partition(|s| s.filename.starts_with(&client_marker));

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "client": client,
        "operator": operator
    })))
}

/// `GET /audio/download/{filename}` — one segment's bytes as `audio/webm`.
///
/// The store rejects any filename that could escape the audio directory,
/// which surfaces here as a 400.
pub async fn download_segment(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let filename = path.into_inner();

    let bytes = state
        .registry
        .store()
        .read_segment(&filename)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => {
                AppError::BadRequest(format!("Invalid segment filename: {}", filename))
            }
            _ => AppError::from(e),
        })?;

    Ok(HttpResponse::Ok()
        .content_type("audio/webm")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(bytes))
}

/// `GET /active_sessions` — sessions with both peers currently connected.
pub async fn active_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let ids = state.registry.active_session_ids();
    let (waiting_clients, waiting_operators) = state.registry.waiting_counts();

    Ok(HttpResponse::Ok().json(json!({
        "count": ids.len(),
        "sessions": ids,
        "waiting_clients": waiting_clients,
        "waiting_operators": waiting_operators
    })))
}

/// `DELETE /sessions/{session_id}/files` — remove a session's persisted
/// segments. Teardown never deletes files, so this is the only way they go
/// away.
pub async fn purge_session_files(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let removed = state.registry.store().purge_session(&session_id)?;

    info!(%session_id, removed, "Purged session segments");

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "removed": removed
    })))
}
