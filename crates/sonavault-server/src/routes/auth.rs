//! Authentication and account routes.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use sonavault_core::auth::{AuthError, DeviceInfo};

use crate::dto::{device_json, session_json, user_json};
use crate::error::{ApiError, ApiResult};
use crate::extract::Auth;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
    pub password: String,
    /// Optional: registering with device data also signs the user in.
    #[serde(default)]
    pub device_data: Option<DeviceInfo>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    let name = body
        .name
        .clone()
        .unwrap_or_else(|| body.email.split('@').next().unwrap_or("user").to_string());
    let user = state
        .auth
        .register(&name, &body.email, &body.password, None)
        .await?;

    let token = match body.device_data {
        Some(device) => Some(
            state
                .auth
                .login(&body.email, &body.password, &device, false)
                .await?
                .bearer,
        ),
        None => None,
    };

    Ok(Json(json!({
        "success": true,
        "token": token,
        "user": user_json(&user),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_approved: bool,
    pub device_data: DeviceInfo,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    match state
        .auth
        .login(&body.email, &body.password, &body.device_data, body.device_approved)
        .await
    {
        Ok(login) => Ok(Json(json!({
            "success": true,
            "token": login.bearer,
            "user": user_json(&login.user),
            "deviceSession": {
                "session": session_json(&login.session),
                "device": device_json(&login.device),
            },
            "warnings": login.warnings,
        }))),
        // Not an error per se: the caller may retry with approval.
        Err(AuthError::DeviceApprovalRequired) => Ok(Json(json!({
            "success": false,
            "requiresDeviceApproval": true,
            "message": "another device is active for this account; approve to continue",
        }))),
        Err(err) => Err(err.into()),
    }
}

pub async fn logout(State(state): State<AppState>, Auth(ctx): Auth) -> ApiResult<Json<Value>> {
    state.auth.logout(ctx.session.id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn me(Auth(ctx): Auth) -> Json<Value> {
    Json(json!({
        "success": true,
        "user": user_json(&ctx.user),
        "device": device_json(&ctx.device),
        "session": session_json(&ctx.session),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDetailsRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn update_details(
    State(state): State<AppState>,
    Auth(ctx): Auth,
    Json(body): Json<UpdateDetailsRequest>,
) -> ApiResult<Json<Value>> {
    if body.name.is_none() && body.email.is_none() && body.password.is_none() {
        return Err(ApiError::BadRequest("nothing to update".to_string()));
    }
    let user = state
        .auth
        .update_details(ctx.user.id, body.name, body.email, body.password.as_deref())
        .await?;
    Ok(Json(json!({ "success": true, "user": user_json(&user) })))
}
