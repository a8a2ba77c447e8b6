//! Chunked upload routes.
//!
//! Chunk bodies arrive as a multipart field named `chunk`, with the upload
//! id and chunk index carried in `X-Upload-Id` / `X-Chunk-Index` headers so
//! the body can stream without a JSON envelope.

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use sonavault_core::chapter::ChapterStatusSummary;
use sonavault_core::library::Visibility;
use sonavault_core::upload::{FinalizeRequest, InitRequest};

use crate::dto::file_json;
use crate::error::{ApiError, ApiResult};
use crate::extract::Auth;
use crate::state::AppState;

pub const UPLOAD_ID_HEADER: &str = "x-upload-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Expected SHA-256 of the whole file, hex.
    pub file_hash: String,
    pub mime_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn init(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Json(body): Json<UploadInitRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .uploads
        .init(
            ctx.user.id,
            InitRequest {
                file_name: body.file_name,
                total_size: body.file_size,
                total_chunks: body.total_chunks,
                expected_sha256: body.file_hash,
                mime_type: body.mime_type,
                title: body.title,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": { "uploadId": session.id, "totalChunks": session.total_chunks },
    })))
}

fn header_value<'h>(headers: &'h HeaderMap, name: &'static str) -> ApiResult<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
}

/// Check the caller owns the upload (admins may touch any).
async fn owned_upload(
    state: &AppState,
    ctx: &sonavault_core::auth::AuthContext,
    upload_id: Uuid,
) -> ApiResult<()> {
    let session = state.uploads.status(upload_id).await?;
    if session.uploader_id != ctx.user.id && !ctx.is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

pub async fn chunk(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let upload_id: Uuid = header_value(&headers, UPLOAD_ID_HEADER)?
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid upload id".to_string()))?;
    let index: u32 = header_value(&headers, CHUNK_INDEX_HEADER)?
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid chunk index".to_string()))?;

    owned_upload(&state, &ctx, upload_id).await?;

    let mut chunk_bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("chunk") {
            chunk_bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?,
            );
        }
    }
    let chunk_bytes =
        chunk_bytes.ok_or_else(|| ApiError::BadRequest("missing chunk field".to_string()))?;

    state.uploads.put_chunk(upload_id, index, &chunk_bytes).await?;

    Ok(Json(json!({
        "success": true,
        "data": { "uploadId": upload_id, "chunkIndex": index },
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    owned_upload(&state, &ctx, upload_id).await?;
    let session = state.uploads.status(upload_id).await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "uploadId": session.id,
            "uploadedChunks": session.received.iter().collect::<Vec<_>>(),
            "receivedCount": session.received.len(),
            "totalChunks": session.total_chunks,
            "state": session.state,
        },
    })))
}

pub async fn finalize(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(upload_id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    owned_upload(&state, &ctx, upload_id).await?;

    let mut request = FinalizeRequest::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("title") => {
                request.title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            Some("durationSeconds") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                request.duration_seconds = Some(
                    text.parse()
                        .map_err(|_| ApiError::BadRequest("invalid duration".to_string()))?,
                );
            }
            Some("visibility") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                request.visibility = Some(match text.as_str() {
                    "public" => Visibility::Public,
                    "private" => Visibility::Private,
                    other => {
                        return Err(ApiError::BadRequest(format!("unknown visibility '{other}'")));
                    }
                });
            }
            Some("cover") => {
                request.cover = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let file = state.uploads.finalize(upload_id, request).await?;
    let summary = ChapterStatusSummary::default();

    Ok(Json(json!({
        "success": true,
        "data": file_json(&file, &summary),
    })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(upload_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    owned_upload(&state, &ctx, upload_id).await?;
    state.uploads.abort(upload_id).await?;
    Ok(Json(json!({ "success": true })))
}
