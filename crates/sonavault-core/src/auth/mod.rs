//! Identity, devices, and device-bound sessions.
//!
//! Users authenticate with an email + password verifier; every session is
//! bound to exactly one device record. The single-device policy and the
//! lock-out state machine live in [`service`].

pub mod password;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use password::PasswordVerifier;
pub use service::{AuthContext, AuthError, AuthService, LoginPolicy, LoginSuccess};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Tablet,
    Mobile,
}

/// A registered account.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    /// Stored lower-cased; lookups are case-insensitive.
    pub email: String,
    pub name: String,
    pub verifier: PasswordVerifier,
    pub role: Role,
    /// Explicit lock flag. Set by admins and by the multi-device policy;
    /// cleared only by admin unlock.
    pub locked: bool,
    /// Temporary lock from the brute-force counter.
    pub lock_until: Option<DateTime<Utc>>,
    pub failed_logins: u32,
    /// Whether the user has acknowledged the multi-device prompt before.
    pub multi_device_acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Whether the account is locked right now.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked || self.lock_until.is_some_and(|until| until > now)
    }
}

/// A device a user has logged in from.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Client-generated identifier, echoed in the `X-Device-Id` header.
    pub client_device_id: String,
    /// Opaque client fingerprint. Session-binding material only, never a
    /// sole authentication factor.
    pub fingerprint: String,
    pub name: String,
    pub device_type: DeviceType,
    pub active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A bearer session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    /// SHA-256 of the bearer credential; the bearer itself is never stored.
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Session {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Device descriptor submitted with a login request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_fingerprint: String,
    pub device_name: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default = "DeviceInfo::default_type")]
    pub device_type: DeviceType,
}

impl DeviceInfo {
    fn default_type() -> DeviceType {
        DeviceType::Desktop
    }
}

/// Advisory record returned alongside a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceWarning {
    pub code: &'static str,
    pub message: String,
    pub device_id: Option<Uuid>,
}
