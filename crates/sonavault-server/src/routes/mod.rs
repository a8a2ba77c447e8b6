//! HTTP route handlers.
//!
//! Handlers are thin: they parse the wire shapes, delegate to core
//! services, and project entities through [`crate::dto`].

pub mod admin;
pub mod auth;
pub mod chapters;
pub mod devices;
pub mod drm;
pub mod files;
pub mod upload;

use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, patch, post, put};
use chrono::Utc;
use serde_json::json;
use tower_http::trace::TraceLayer;

use sonavault_core::access;
use sonavault_core::auth::AuthContext;
use sonavault_core::library::AudioFile;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Check the caller's viewing rights on a file, distinguishing an expired
/// grant from plain lack of access.
pub(crate) async fn authorize_view(
    state: &AppState,
    ctx: &AuthContext,
    file: &AudioFile,
) -> ApiResult<()> {
    let now = Utc::now();
    let grant = state.store.grant_for(ctx.user.id, file.id).await?;

    if access::can_view(&ctx.user, file, grant.as_ref(), now) {
        return Ok(());
    }
    if grant.is_some_and(|g| g.can_view && g.expires_at.is_some_and(|expiry| expiry <= now)) {
        return Err(ApiError::AccessExpired);
    }
    Err(ApiError::Forbidden)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Assemble the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Authentication & account
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/auth/updatedetails", put(auth::update_details))
        // Devices
        .route("/devices", get(devices::list))
        .route("/devices/others", delete(devices::deactivate_others))
        .route("/devices/{device_id}", delete(devices::deactivate))
        // Files & checkpoints
        .route("/files", post(files::create).get(files::list))
        .route("/files/{file_id}", get(files::get))
        .route(
            "/files/{file_id}/checkpoints",
            get(files::list_checkpoints).post(files::create_checkpoint),
        )
        .route(
            "/files/{file_id}/checkpoints/{checkpoint_id}",
            delete(files::delete_checkpoint),
        )
        // Chapters
        .route(
            "/files/{file_id}/chapters",
            get(chapters::list).post(chapters::upsert),
        )
        .route("/files/{file_id}/chapters/status", get(chapters::status))
        .route("/files/{file_id}/chapters/finalize", post(chapters::finalize))
        .route("/files/{file_id}/chapters/sample", post(chapters::sample))
        .route(
            "/files/{file_id}/chapters/{chapter_id}",
            put(chapters::update).delete(chapters::delete),
        )
        .route(
            "/files/{file_id}/chapters/{chapter_id}/stream-url",
            post(chapters::stream_url),
        )
        // Chunked upload
        .route("/audio/upload/init", post(upload::init))
        .route("/audio/upload/chunk", post(upload::chunk))
        .route("/audio/upload/status/{upload_id}", get(upload::status))
        .route("/audio/upload/finalize/{upload_id}", post(upload::finalize))
        .route("/audio/upload/cancel/{upload_id}", delete(upload::cancel))
        // DRM
        .route("/drm/status/{file_id}", get(drm::status))
        .route("/drm/session/{file_id}", post(drm::create_session))
        .route("/drm/signed-url/{file_id}", post(drm::signed_url))
        .route("/drm/stream/{token}", get(drm::stream))
        // Admin
        .route("/admin/files/{file_id}", put(admin::update_file).delete(admin::delete_file))
        .route("/admin/users/{user_id}/sessions", get(admin::user_sessions))
        .route(
            "/admin/users/{user_id}/sessions/{session_id}",
            delete(admin::revoke_session),
        )
        .route("/admin/users/{user_id}/unlock", patch(admin::unlock_user))
        .route("/admin/file-access", post(admin::create_grant))
        .route("/admin/file-access/file/{file_id}", get(admin::grants_for_file))
        .route(
            "/admin/file-access/{grant_id}",
            put(admin::update_grant).delete(admin::delete_grant),
        )
        .route("/admin/keys/rotate", post(admin::rotate_signing_key))
        // Chunk bodies run up to MAX_CHUNK_BYTES plus multipart framing;
        // axum's default 2 MiB cap is too low for them.
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
