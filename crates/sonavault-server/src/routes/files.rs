//! File catalog and checkpoint routes.

use axum::Json;
use axum::extract::{Multipart, Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use sonavault_core::access;
use sonavault_core::chapter::ChapterStatusSummary;
use sonavault_core::library::{AudioFile, Checkpoint, Visibility};

use crate::dto::file_json;
use crate::error::{ApiError, ApiResult};
use crate::extract::Auth;
use crate::state::AppState;

use super::authorize_view;

/// Small-file direct upload (multipart). Large files go through the
/// chunked upload endpoints.
pub async fn create(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut audio: Option<(Vec<u8>, String, String)> = None; // bytes, name, mime
    let mut title = None;
    let mut visibility = Visibility::Private;
    let mut duration = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                let name = field.file_name().unwrap_or("audio").to_string();
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                audio = Some((bytes.to_vec(), name, mime));
            }
            Some("title") => {
                title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            Some("visibility") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                if text == "public" {
                    visibility = Visibility::Public;
                }
            }
            Some("durationSeconds") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                duration = Some(
                    text.parse::<f64>()
                        .map_err(|_| ApiError::BadRequest("invalid duration".to_string()))?,
                );
            }
            _ => {}
        }
    }

    let (bytes, name, mime) = audio
        .ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    let duration = duration
        .filter(|d| *d > 0.0)
        .ok_or_else(|| ApiError::BadRequest("missing or invalid durationSeconds".to_string()))?;

    let id = Uuid::new_v4();
    let path = state.media_root.join("originals").join(id.to_string());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| ApiError::IoFailed)?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|_| ApiError::IoFailed)?;

    let file = AudioFile {
        id,
        title: title.unwrap_or(name),
        uploader_id: ctx.user.id,
        sha256: hex::encode(Sha256::digest(&bytes)),
        size: bytes.len() as u64,
        mime_type: mime,
        duration_seconds: duration,
        visibility,
        cover: None,
        storage_path: path,
        created_at: Utc::now(),
    };
    state.store.insert_file(file.clone()).await?;

    Ok(Json(json!({
        "success": true,
        "data": file_json(&file, &ChapterStatusSummary::default()),
    })))
}

pub async fn list(State(state): State<AppState>, Auth(ctx): Auth) -> ApiResult<Json<Value>> {
    let now = Utc::now();
    let mut visible = Vec::new();
    for file in state.store.list_files().await? {
        let grant = state.store.grant_for(ctx.user.id, file.id).await?;
        if access::can_view(&ctx.user, &file, grant.as_ref(), now) {
            let chapters = state.store.chapters_for_file(file.id).await?;
            visible.push(file_json(&file, &ChapterStatusSummary::of(&chapters)));
        }
    }
    Ok(Json(json!({
        "success": true,
        "count": visible.len(),
        "data": visible,
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;
    let chapters = state.store.chapters_for_file(file.id).await?;
    Ok(Json(json!({
        "success": true,
        "data": file_json(&file, &ChapterStatusSummary::of(&chapters)),
    })))
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    pub position_seconds: f64,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;
    let checkpoints = state.store.checkpoints_for(ctx.user.id, file_id).await?;
    Ok(Json(json!({ "success": true, "data": checkpoints })))
}

pub async fn create_checkpoint(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
    Json(body): Json<CheckpointRequest>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let checkpoint = Checkpoint {
        id: Uuid::new_v4(),
        user_id: ctx.user.id,
        file_id,
        position_seconds: body.position_seconds,
        label: body.label,
        description: body.description,
        created_at: Utc::now(),
    };
    state.store.upsert_checkpoint(checkpoint.clone()).await?;
    Ok(Json(json!({ "success": true, "data": checkpoint })))
}

pub async fn delete_checkpoint(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path((file_id, checkpoint_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    let mine = state
        .store
        .checkpoints_for(ctx.user.id, file_id)
        .await?
        .iter()
        .any(|c| c.id == checkpoint_id);
    if !mine && !ctx.is_admin() {
        return Err(ApiError::NotFound("checkpoint"));
    }
    state.store.delete_checkpoint(checkpoint_id).await?;
    Ok(Json(json!({ "success": true })))
}
