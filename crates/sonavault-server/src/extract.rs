//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use sonavault_core::auth::AuthContext;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the client device id, checked on every request.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// An authenticated request identity.
///
/// Resolves `Authorization: Bearer` to a live session and enforces the
/// device binding: a request whose `X-Device-Id` disagrees with the
/// session's device revokes the session and fails with a stable code the
/// client maps to its logout flow.
pub struct Auth(pub AuthContext);

/// Same as [`Auth`] but additionally requires the admin role.
pub struct AdminAuth(pub AuthContext);

fn bearer_from(parts: &Parts) -> Result<&str, ApiError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(ApiError::MissingCredential)?
        .to_str()
        .map_err(|_| ApiError::InvalidCredential)?;
    header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::InvalidCredential)
}

impl FromRequestParts<AppState> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let bearer = bearer_from(parts)?;
        let device_header = parts
            .headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok());

        let ctx = state.auth.resolve_bearer(bearer, device_header).await?;
        Ok(Auth(ctx))
    }
}

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Auth(ctx) = Auth::from_request_parts(parts, state).await?;
        if !ctx.is_admin() {
            return Err(ApiError::Forbidden);
        }
        Ok(AdminAuth(ctx))
    }
}
