//! Device administration for the authenticated user.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::dto::device_json;
use crate::error::ApiResult;
use crate::extract::Auth;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>, Auth(ctx): Auth) -> ApiResult<Json<Value>> {
    let devices = state.auth.devices(ctx.user.id).await?;
    Ok(Json(json!({
        "success": true,
        "count": devices.len(),
        "data": devices.iter().map(device_json).collect::<Vec<_>>(),
    })))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Path(device_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.auth.deactivate_device(ctx.user.id, device_id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn deactivate_others(
    State(state): State<AppState>,
    Auth(ctx): Auth,
) -> ApiResult<Json<Value>> {
    let count = state
        .auth
        .deactivate_other_devices(ctx.user.id, ctx.device.id)
        .await?;
    Ok(Json(json!({ "success": true, "deactivated": count })))
}
