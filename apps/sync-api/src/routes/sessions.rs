//! Read-only inspection of live rooms.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/roster", get(get_roster))
}

/// The last snapshot published in a session, as sent on the wire.
#[derive(Debug, Serialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct SessionSnapshot(pub Value);

#[derive(Debug, Serialize, ToSchema)]
pub struct RosterMember {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RosterResponse {
    pub session_id: String,
    pub members: Vec<RosterMember>,
}

fn checked(session_id: String) -> Result<String, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::validation("session_id", "Session ID must not be blank"));
    }
    Ok(session_id)
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/:session_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}",
    tag = "Sessions",
    params(
        ("session_id" = String, Path, description = "Session ID"),
    ),
    responses(
        (status = 200, description = "Cached session snapshot", body = SessionSnapshot),
        (status = 400, description = "Blank session ID", body = ApiErrorBody),
        (status = 404, description = "Nothing cached for this session", body = ApiErrorBody),
    ),
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session_id = checked(session_id)?;
    let snapshot = state
        .registry
        .cached_snapshot(&session_id)
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(SessionSnapshot(Value::clone(&snapshot))))
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions/:session_id/roster
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}/roster",
    tag = "Sessions",
    params(
        ("session_id" = String, Path, description = "Session ID"),
    ),
    responses(
        (status = 200, description = "Connections joined on this instance", body = RosterResponse),
        (status = 400, description = "Blank session ID", body = ApiErrorBody),
    ),
)]
pub async fn get_roster(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RosterResponse>, ApiError> {
    let session_id = checked(session_id)?;
    let members = state
        .registry
        .roster(&session_id)
        .into_iter()
        .map(|entry| RosterMember {
            id: entry.id,
            name: entry.name,
        })
        .collect();
    Ok(Json(RosterResponse {
        session_id,
        members,
    }))
}
