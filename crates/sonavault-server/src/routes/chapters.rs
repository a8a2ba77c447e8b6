//! Chapter definition, finalization, and stream-URL routes.

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use sonavault_core::chapter::{
    ChapterDraft, ChapterStatusSummary, ChapterUpdate, StorageType,
};

use crate::dto::{chapter_json, chapter_summary_json};
use crate::error::{ApiError, ApiResult};
use crate::extract::{AdminAuth, Auth};
use crate::state::AppState;

use super::authorize_view;

pub async fn list(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let chapters = state.chapters.list(file_id).await?;
    Ok(Json(json!({
        "success": true,
        "count": chapters.len(),
        "data": chapters.iter().map(chapter_json).collect::<Vec<_>>(),
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let chapters = state.chapters.list(file_id).await?;
    Ok(Json(json!({
        "success": true,
        "data": chapter_summary_json(&ChapterStatusSummary::of(&chapters)),
    })))
}

#[derive(Deserialize)]
pub struct UpsertRequest {
    pub chapters: Vec<ChapterDraft>,
}

pub async fn upsert(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
    Json(body): Json<UpsertRequest>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    let chapters = state.chapters.upsert(&file, body.chapters).await?;
    Ok(Json(json!({
        "success": true,
        "count": chapters.len(),
        "data": chapters.iter().map(chapter_json).collect::<Vec<_>>(),
    })))
}

pub async fn update(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path((file_id, chapter_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ChapterUpdate>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    let chapter = state.chapters.update(&file, chapter_id, body).await?;
    Ok(Json(json!({ "success": true, "data": chapter_json(&chapter) })))
}

#[derive(Deserialize)]
pub struct DeleteParams {
    /// Ready chapters refuse deletion unless this is set.
    #[serde(default)]
    pub reset: bool,
}

pub async fn delete(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path((_file_id, chapter_id)): Path<(Uuid, Uuid)>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<Value>> {
    state.chapters.delete(chapter_id, params.reset).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub storage_type: StorageType,
}

pub async fn finalize(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
    Json(body): Json<FinalizeRequest>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    let outcome = state
        .chapters
        .finalize_chapters(&file, body.storage_type)
        .await?;

    let chapters = state.chapters.list(file_id).await?;
    let summary = ChapterStatusSummary::of(&chapters);

    Ok(Json(json!({
        "success": true,
        "finalizedChapters": outcome.finalized,
        "errors": outcome.errors,
        "summary": {
            "pending": summary.pending,
            "ready": summary.ready,
            "failed": summary.failed,
            "finalized": outcome.finalized,
        },
    })))
}

pub async fn sample(
    State(state): State<AppState>,
    AdminAuth(_ctx): AdminAuth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    let chapters = state.chapters.load_sample(&file).await?;
    Ok(Json(json!({
        "success": true,
        "count": chapters.len(),
        "data": chapters.iter().map(chapter_json).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUrlRequest {
    /// Token lifetime in seconds; defaults to the configured token TTL.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub async fn stream_url(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path((file_id, chapter_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<StreamUrlRequest>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let chapter = state.chapters.chapter(chapter_id).await?;
    if chapter.file_id != file_id {
        return Err(ApiError::NotFound("chapter"));
    }
    if chapter.status != sonavault_core::chapter::ChapterStatus::Ready {
        return Err(ApiError::ChapterNotReady);
    }

    let ttl = body
        .expires_in
        .filter(|secs| *secs > 0)
        .map(Duration::seconds);
    let token = state.mint.issue_chapter(
        file_id,
        chapter_id,
        ctx.session.id,
        ctx.device.id,
        ttl,
    )?;
    let expires_in = ttl.unwrap_or_else(|| state.mint.default_ttl()).num_seconds();

    Ok(Json(json!({
        "success": true,
        "streamUrl": format!("/drm/stream/{token}"),
        "expiresIn": expires_in,
    })))
}
