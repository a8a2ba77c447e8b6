//! Admin routes: file management, user sessions, access grants, key
//! rotation.

use axum::Json;
use axum::extract::{Multipart, Path, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use sonavault_core::chapter::{ChapterStatusSummary, ChapterStorage};
use sonavault_core::library::{CoverImage, FileAccess, Visibility};

use crate::dto::{file_json, grant_json, session_json, user_json};
use crate::error::{ApiError, ApiResult};
use crate::extract::AdminAuth;
use crate::state::AppState;

/// Update file metadata; multipart so a new cover can ride along.
pub async fn update_file(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut file = state.store.file_by_id(file_id).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("title") => {
                file.title = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            }
            Some("visibility") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                file.visibility = match text.as_str() {
                    "public" => Visibility::Public,
                    "private" => Visibility::Private,
                    other => {
                        return Err(ApiError::BadRequest(format!("unknown visibility '{other}'")));
                    }
                };
            }
            Some("cover") => {
                use base64::Engine as _;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                file.cover = Some(CoverImage::Inline(
                    base64::engine::general_purpose::STANDARD.encode(&bytes),
                ));
            }
            _ => {}
        }
    }

    state.store.update_file(file.clone()).await?;
    let chapters = state.store.chapters_for_file(file.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": file_json(&file, &ChapterStatusSummary::of(&chapters)),
    })))
}

/// Delete a file, its chapters, and every stored blob.
pub async fn delete_file(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;

    for chapter in state.store.chapters_for_file(file_id).await? {
        if let Some(ChapterStorage::Filesystem(path)) = &chapter.storage {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
    let _ = tokio::fs::remove_file(&file.storage_path).await;
    if let Some(CoverImage::Path(path)) = &file.cover {
        let _ = tokio::fs::remove_file(path).await;
    }

    state.store.delete_file(file_id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn user_sessions(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let sessions = state.auth.sessions_for_user(user_id).await?;
    Ok(Json(json!({
        "success": true,
        "count": sessions.len(),
        "data": sessions.iter().map(session_json).collect::<Vec<_>>(),
    })))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path((user_id, session_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    // The session must belong to the addressed user.
    let owned = state
        .auth
        .sessions_for_user(user_id)
        .await?
        .iter()
        .any(|s| s.id == session_id);
    if !owned {
        return Err(ApiError::NotFound("session"));
    }
    state.auth.force_logout(session_id, "revoked by admin").await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn unlock_user(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let user = state.auth.unlock(user_id).await?;
    Ok(Json(json!({ "success": true, "user": user_json(&user) })))
}

// ---------------------------------------------------------------------------
// Access grants
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantRequest {
    pub user_id: Uuid,
    pub file_id: Uuid,
    #[serde(default = "default_can_view")]
    pub can_view: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_can_view() -> bool {
    true
}

pub async fn create_grant(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Json(body): Json<CreateGrantRequest>,
) -> ApiResult<Json<Value>> {
    // Both ends must exist.
    state.store.user_by_id(body.user_id).await?;
    state.store.file_by_id(body.file_id).await?;

    let grant = FileAccess {
        id: Uuid::new_v4(),
        user_id: body.user_id,
        file_id: body.file_id,
        can_view: body.can_view,
        expires_at: body.expires_at,
        granted_at: Utc::now(),
    };
    state.store.insert_grant(grant.clone()).await?;
    Ok(Json(json!({ "success": true, "data": grant_json(&grant) })))
}

pub async fn grants_for_file(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let grants = state.store.grants_for_file(file_id).await?;
    Ok(Json(json!({
        "success": true,
        "count": grants.len(),
        "data": grants.iter().map(grant_json).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGrantRequest {
    #[serde(default)]
    pub can_view: Option<bool>,
    #[serde(default)]
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub async fn update_grant(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(grant_id): Path<Uuid>,
    Json(body): Json<UpdateGrantRequest>,
) -> ApiResult<Json<Value>> {
    let mut grant = state.store.grant_by_id(grant_id).await?;
    if let Some(can_view) = body.can_view {
        grant.can_view = can_view;
    }
    if let Some(expires_at) = body.expires_at {
        grant.expires_at = expires_at;
    }
    state.store.update_grant(grant.clone()).await?;
    Ok(Json(json!({ "success": true, "data": grant_json(&grant) })))
}

pub async fn delete_grant(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(grant_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.store.delete_grant(grant_id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Rotate the stream-token signing key, invalidating every outstanding
/// token. Clients must re-issue.
pub async fn rotate_signing_key(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
) -> ApiResult<Json<Value>> {
    let generation = state.signing_keys.rotate();
    tracing::info!(generation, "Stream token signing key rotated");
    Ok(Json(json!({ "success": true, "generation": generation })))
}
