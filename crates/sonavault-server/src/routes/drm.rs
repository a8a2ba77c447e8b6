//! DRM session issuance and the range streaming endpoint.
//!
//! All three credential forms redeem at `GET /drm/stream/{token}`; the
//! token's type selects the byte source. Every redemption re-runs the full
//! pipeline: bearer auth, device binding, token validation (including
//! wall-clock expiry), file authorization, then range-aware streaming.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use sonavault_core::chapter::{ChapterStatus, ChapterStatusSummary};
use sonavault_core::stream::{resolve_chapter_source, resolve_file_source, time_to_offset};
use sonavault_core::token::{END_OF_FILE, TokenKind, validate_window};

use crate::error::{ApiError, ApiResult};
use crate::extract::Auth;
use crate::range::parse_range;
use crate::state::AppState;
use crate::stream::stream_slice;

use super::authorize_view;

pub async fn status(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let chapters = state.store.chapters_for_file(file_id).await?;
    let summary = ChapterStatusSummary::of(&chapters);

    Ok(Json(json!({
        "success": true,
        "fileId": file.id,
        "duration": file.duration_seconds,
        "size": file.size,
        "mimeType": file.mime_type,
        "chaptered": summary.ready > 0,
        "chapters": {
            "pending": summary.pending,
            "ready": summary.ready,
            "failed": summary.failed,
        },
    })))
}

pub async fn create_session(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let token = state
        .mint
        .issue_session(file_id, ctx.session.id, ctx.device.id)?;

    Ok(Json(json!({
        "success": true,
        "sessionToken": token,
        "expiresIn": state.mint.default_ttl().num_seconds(),
        "duration": file.duration_seconds,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlRequest {
    pub start_time: f64,
    /// `-1` streams to the end of the file.
    #[serde(default = "default_end_time")]
    pub end_time: f64,
    /// Token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

fn default_end_time() -> f64 {
    END_OF_FILE
}

pub async fn signed_url(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(file_id): Path<Uuid>,
    Json(body): Json<SignedUrlRequest>,
) -> ApiResult<Json<Value>> {
    let file = state.store.file_by_id(file_id).await?;
    authorize_view(&state, &ctx, &file).await?;

    let (start, end) = validate_window(file.duration_seconds, body.start_time, body.end_time)?;
    let ttl = body
        .expires_in
        .filter(|secs| *secs > 0)
        .map(Duration::seconds);

    let token = state.mint.issue_signed_url(
        file_id,
        ctx.session.id,
        ctx.device.id,
        start,
        end,
        ttl,
    )?;
    let expires_in = ttl.unwrap_or_else(|| state.mint.default_ttl()).num_seconds();

    Ok(Json(json!({
        "success": true,
        "signedUrl": format!("/drm/stream/{token}"),
        "expiresIn": expires_in,
    })))
}

pub async fn stream(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let claims = state.mint.verify(&token)?;

    // The token must belong to this exact session and device; a re-login
    // (new session) invalidates previously issued stream tokens.
    if claims.sid != ctx.session.id {
        return Err(ApiError::InvalidToken);
    }
    if claims.did != ctx.device.id {
        return Err(ApiError::DeviceMismatch);
    }

    let file = state.store.file_by_id(claims.fid).await?;
    authorize_view(&state, &ctx, &file).await?;

    // Resolve the byte source and the addressable window within it.
    let (source, window_offset, window_len) = match claims.typ {
        TokenKind::DrmSession => {
            let source = resolve_file_source(&state.store, &file).await?;
            let total = source.len();
            (source, 0, total)
        }
        TokenKind::SignedUrl => {
            let source = resolve_file_source(&state.store, &file).await?;
            let total = source.len();
            let start = claims.st.ok_or(ApiError::InvalidToken)?;
            let base = time_to_offset(file.duration_seconds, total, start);
            let end = claims
                .et
                .map_or(total, |t| time_to_offset(file.duration_seconds, total, t))
                .max(base);
            (source, base, end - base)
        }
        TokenKind::ChapterStream => {
            let chapter_id = claims.cid.ok_or(ApiError::InvalidToken)?;
            let chapter = state.store.chapter_by_id(chapter_id).await?;
            if chapter.file_id != claims.fid {
                return Err(ApiError::InvalidToken);
            }
            if chapter.status != ChapterStatus::Ready {
                return Err(ApiError::ChapterNotReady);
            }
            let source = resolve_chapter_source(&state.store, chapter_id).await?;
            let total = source.len();
            (source, 0, total)
        }
    };

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let range = parse_range(range_header, window_len)?;

    stream_slice(
        state,
        source,
        window_offset,
        window_len,
        range,
        &file.mime_type,
    )
    .await
}
