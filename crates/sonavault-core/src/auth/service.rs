//! Login, session, and device policy.
//!
//! # Account state machine
//!
//! `Active -> Locked` via explicit admin action, the multi-device policy
//! violation, or the brute-force threshold; `Locked -> Active` only via
//! admin unlock.
//!
//! # Single-device policy
//!
//! At most one device per user is active at a time. A login from a second
//! device first asks the caller to acknowledge (`DeviceApprovalRequired`);
//! a login that repeats the attempt with `device_approved = true` while
//! another device is still active locks the account (`PolicyViolation`)
//! pending admin unlock. This is the documented behavior, not an accident:
//! acknowledged concurrent device use is treated as credential sharing.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::store::{Store, StoreError};

use super::password::{PasswordError, PasswordVerifier};
use super::{Device, DeviceInfo, DeviceWarning, Role, Session, User};

#[derive(Error, Debug)]
pub enum AuthError {
    /// No bearer credential was supplied.
    #[error("missing credential")]
    MissingCredential,

    /// Unknown user, wrong password, or dead session.
    #[error("invalid credential")]
    InvalidCredential,

    /// The account is locked (explicitly or by backoff).
    #[error("account is locked")]
    Locked,

    /// A different device is active and the user has not acknowledged
    /// multi-device use. Not a failure per se; the caller may retry with
    /// `device_approved = true`.
    #[error("another device is active; device approval required")]
    DeviceApprovalRequired,

    /// Acknowledged second-device login: the account has been locked.
    #[error("concurrent device use after acknowledgement; account locked")]
    PolicyViolation,

    /// The request's device id does not match the session's device.
    #[error("device does not match session")]
    DeviceMismatch,

    #[error("email already registered")]
    EmailTaken,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tunables for the lock-out and session lifecycle.
#[derive(Debug, Clone)]
pub struct LoginPolicy {
    /// Failed attempts before a temporary lock.
    pub max_failed_logins: u32,
    /// Length of the temporary lock.
    pub lock_backoff: Duration,
    /// Bearer session lifetime.
    pub session_ttl: Duration,
}

impl Default for LoginPolicy {
    fn default() -> Self {
        Self {
            max_failed_logins: 5,
            lock_backoff: Duration::minutes(15),
            session_ttl: Duration::hours(24),
        }
    }
}

/// Result of a successful login.
#[derive(Debug)]
pub struct LoginSuccess {
    /// The bearer credential. Returned once, never stored.
    pub bearer: String,
    pub user: User,
    pub device: Device,
    pub session: Session,
    pub warnings: Vec<DeviceWarning>,
}

/// A resolved, live request identity.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub device: Device,
    pub session: Session,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.user.role == Role::Admin
    }
}

/// Identity and device-binding service.
pub struct AuthService {
    store: Arc<dyn Store>,
    policy: LoginPolicy,
}

fn hash_bearer(bearer: &str) -> String {
    hex::encode(Sha256::digest(bearer.as_bytes()))
}

fn new_bearer() -> String {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, policy: LoginPolicy) -> Self {
        Self { store, policy }
    }

    /// Create a user. The first registered user becomes the admin;
    /// role assignment beyond that is an external concern.
    #[instrument(level = "info", skip(self, password))]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        verifier_override: Option<PasswordVerifier>,
    ) -> Result<User, AuthError> {
        if self.store.user_by_email(email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let role = if self.store.user_count().await? == 0 {
            Role::Admin
        } else {
            Role::User
        };

        let verifier = match verifier_override {
            Some(v) => v,
            None => PasswordVerifier::create(password)?,
        };

        let user = User {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            name: name.to_string(),
            verifier,
            role,
            locked: false,
            lock_until: None,
            failed_logins: 0,
            multi_device_acknowledged: false,
            created_at: Utc::now(),
        };

        match self.store.insert_user(user.clone()).await {
            Ok(()) => Ok(user),
            Err(StoreError::Conflict(_)) => Err(AuthError::EmailTaken),
            Err(e) => Err(e.into()),
        }
    }

    /// Verify credentials and enforce the device policy ladder.
    #[instrument(level = "info", skip(self, password, device_info), fields(email = %email))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device_info: &DeviceInfo,
        device_approved: bool,
    ) -> Result<LoginSuccess, AuthError> {
        let now = Utc::now();
        let Some(mut user) = self.store.user_by_email(email).await? else {
            return Err(AuthError::InvalidCredential);
        };

        if user.is_locked(now) {
            return Err(AuthError::Locked);
        }

        if !user.verifier.verify(password)? {
            user.failed_logins += 1;
            if user.failed_logins >= self.policy.max_failed_logins {
                user.lock_until = Some(now + self.policy.lock_backoff);
                user.failed_logins = 0;
                warn!(user_id = %user.id, "Brute-force threshold reached; temporary lock applied");
            }
            self.store.update_user(user).await?;
            return Err(AuthError::InvalidCredential);
        }

        // Successful verification resets the failure counter.
        user.failed_logins = 0;
        user.lock_until = None;

        let devices = self.store.devices_for_user(user.id).await?;
        let other_active: Vec<&Device> = devices
            .iter()
            .filter(|d| d.active && d.client_device_id != device_info.device_id)
            .collect();

        if !other_active.is_empty() {
            if device_approved {
                // Acknowledged concurrent use: lock the account.
                user.locked = true;
                user.multi_device_acknowledged = true;
                self.store.update_user(user.clone()).await?;
                self.revoke_all_sessions(user.id, "multi-device policy violation")
                    .await?;
                warn!(user_id = %user.id, "Account locked by multi-device policy");
                return Err(AuthError::PolicyViolation);
            }
            if !user.multi_device_acknowledged {
                self.store.update_user(user).await?;
                return Err(AuthError::DeviceApprovalRequired);
            }
        }

        let mut warnings = Vec::new();

        // Deactivate peers so the single-device invariant holds after this
        // login.
        for peer in devices
            .iter()
            .filter(|d| d.active && d.client_device_id != device_info.device_id)
        {
            let mut peer = (*peer).clone();
            peer.active = false;
            self.store.update_device(peer.clone()).await?;
            warnings.push(DeviceWarning {
                code: "device_deactivated",
                message: format!("device '{}' was signed out", peer.name),
                device_id: Some(peer.id),
            });
        }

        let device = match devices
            .iter()
            .find(|d| d.client_device_id == device_info.device_id)
        {
            Some(existing) => {
                let mut device = existing.clone();
                if device.fingerprint != device_info.device_fingerprint {
                    warnings.push(DeviceWarning {
                        code: "fingerprint_changed",
                        message: "device fingerprint changed since last login".to_string(),
                        device_id: Some(device.id),
                    });
                    device.fingerprint = device_info.device_fingerprint.clone();
                }
                device.active = true;
                device.name = device_info.device_name.clone();
                device.last_activity = now;
                self.store.update_device(device.clone()).await?;
                device
            }
            None => {
                let device = Device {
                    id: Uuid::new_v4(),
                    user_id: user.id,
                    client_device_id: device_info.device_id.clone(),
                    fingerprint: device_info.device_fingerprint.clone(),
                    name: device_info.device_name.clone(),
                    device_type: device_info.device_type,
                    active: true,
                    first_seen: now,
                    last_activity: now,
                };
                self.store.insert_device(device.clone()).await?;
                warnings.push(DeviceWarning {
                    code: "new_device",
                    message: format!("first login from device '{}'", device.name),
                    device_id: Some(device.id),
                });
                device
            }
        };

        self.store.update_user(user.clone()).await?;

        let bearer = new_bearer();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user.id,
            device_id: device.id,
            token_hash: hash_bearer(&bearer),
            issued_at: now,
            expires_at: now + self.policy.session_ttl,
            revoked: false,
        };
        self.store.insert_session(session.clone()).await?;

        info!(user_id = %user.id, session_id = %session.id, "Login succeeded");
        Ok(LoginSuccess {
            bearer,
            user,
            device,
            session,
            warnings,
        })
    }

    /// Resolve a bearer credential to a live session, enforcing the device
    /// header binding. A mismatched device id revokes the session.
    pub async fn resolve_bearer(
        &self,
        bearer: &str,
        device_header: Option<&str>,
    ) -> Result<AuthContext, AuthError> {
        let now = Utc::now();
        let Some(session) = self.store.session_by_token_hash(&hash_bearer(bearer)).await? else {
            return Err(AuthError::InvalidCredential);
        };
        if !session.is_live(now) {
            return Err(AuthError::InvalidCredential);
        }

        let user = match self.store.user_by_id(session.user_id).await {
            Ok(user) => user,
            Err(StoreError::NotFound { .. }) => return Err(AuthError::InvalidCredential),
            Err(e) => return Err(e.into()),
        };
        if user.is_locked(now) {
            self.revoke(session, "account locked").await?;
            return Err(AuthError::Locked);
        }

        let mut device = self.store.device_by_id(session.device_id).await?;
        if let Some(header) = device_header {
            if header != device.client_device_id {
                self.revoke(session, "device id mismatch").await?;
                return Err(AuthError::DeviceMismatch);
            }
        }

        device.last_activity = now;
        self.store.update_device(device.clone()).await?;

        Ok(AuthContext {
            user,
            device,
            session,
        })
    }

    async fn revoke(&self, mut session: Session, reason: &str) -> Result<(), AuthError> {
        session.revoked = true;
        self.store.update_session(session.clone()).await?;
        info!(session_id = %session.id, reason, "Session revoked");
        Ok(())
    }

    /// Revoke the session and deactivate its device.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        let session = self.store.session_by_id(session_id).await?;
        let device_id = session.device_id;
        self.revoke(session, "logout").await?;

        if let Ok(mut device) = self.store.device_by_id(device_id).await {
            device.active = false;
            self.store.update_device(device).await?;
        }
        Ok(())
    }

    /// Server-initiated revocation (admin tooling, policy enforcement).
    pub async fn force_logout(&self, session_id: Uuid, reason: &str) -> Result<(), AuthError> {
        let session = self.store.session_by_id(session_id).await?;
        self.revoke(session, reason).await
    }

    async fn revoke_all_sessions(&self, user_id: Uuid, reason: &str) -> Result<(), AuthError> {
        for session in self.store.sessions_for_user(user_id).await? {
            if !session.revoked {
                self.revoke(session, reason).await?;
            }
        }
        Ok(())
    }

    pub async fn devices(&self, user_id: Uuid) -> Result<Vec<Device>, AuthError> {
        Ok(self.store.devices_for_user(user_id).await?)
    }

    /// Deactivate one device and revoke its sessions.
    pub async fn deactivate_device(&self, user_id: Uuid, device_id: Uuid) -> Result<(), AuthError> {
        let mut device = self.store.device_by_id(device_id).await?;
        if device.user_id != user_id {
            return Err(AuthError::NotFound);
        }
        device.active = false;
        self.store.update_device(device).await?;

        for session in self.store.sessions_for_user(user_id).await? {
            if session.device_id == device_id && !session.revoked {
                self.revoke(session, "device deactivated").await?;
            }
        }
        Ok(())
    }

    /// Deactivate every device except the given one.
    pub async fn deactivate_other_devices(
        &self,
        user_id: Uuid,
        keep_device_id: Uuid,
    ) -> Result<usize, AuthError> {
        let mut count = 0;
        for device in self.store.devices_for_user(user_id).await? {
            if device.id != keep_device_id && device.active {
                self.deactivate_device(user_id, device.id).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Admin unlock: the only `Locked -> Active` transition.
    pub async fn unlock(&self, user_id: Uuid) -> Result<User, AuthError> {
        let mut user = self.store.user_by_id(user_id).await?;
        user.locked = false;
        user.lock_until = None;
        user.failed_logins = 0;
        self.store.update_user(user.clone()).await?;
        info!(user_id = %user.id, "Account unlocked by admin");
        Ok(user)
    }

    /// Update account details for the authenticated user.
    pub async fn update_details(
        &self,
        user_id: Uuid,
        name: Option<String>,
        email: Option<String>,
        password: Option<&str>,
    ) -> Result<User, AuthError> {
        let mut user = self.store.user_by_id(user_id).await?;
        if let Some(name) = name {
            user.name = name;
        }
        if let Some(email) = email {
            let email = email.to_lowercase();
            if !user.email.eq_ignore_ascii_case(&email) {
                if self.store.user_by_email(&email).await?.is_some() {
                    return Err(AuthError::EmailTaken);
                }
                user.email = email;
            }
        }
        if let Some(password) = password {
            user.verifier = PasswordVerifier::create(password)?;
        }
        self.store.update_user(user.clone()).await?;
        Ok(user)
    }

    pub async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, AuthError> {
        Ok(self.store.sessions_for_user(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DeviceType;
    use crate::auth::password::test_verifier;
    use crate::store::MemoryStore;

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            device_fingerprint: format!("fp-{id}"),
            device_name: format!("Device {id}"),
            timezone: None,
            language: None,
            platform: None,
            device_type: DeviceType::Desktop,
        }
    }

    fn service() -> AuthService {
        AuthService::new(Arc::new(MemoryStore::new()), LoginPolicy::default())
    }

    async fn registered(service: &AuthService, email: &str) -> User {
        service
            .register("Tester", email, "pw", Some(test_verifier("pw")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_user_is_admin() {
        let service = service();
        let first = registered(&service, "a@x.y").await;
        let second = registered(&service, "b@x.y").await;
        assert_eq!(first.role, Role::Admin);
        assert_eq!(second.role, Role::User);
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let service = service();
        registered(&service, "a@x.y").await;
        let err = service
            .register("Dup", "A@X.Y", "pw", Some(test_verifier("pw")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
    }

    #[tokio::test]
    async fn device_policy_ladder() {
        let service = service();
        registered(&service, "u@x.y").await;

        // First device logs in fine.
        let first = service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap();
        assert!(first.device.active);

        // Second device without approval: prompt, account untouched.
        let err = service
            .login("u@x.y", "pw", &device("d2"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DeviceApprovalRequired));

        // Second device with approval: permanent lock.
        let err = service
            .login("u@x.y", "pw", &device("d2"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PolicyViolation));

        // Correct credentials no longer help.
        let err = service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Locked));

        // The first device's session was revoked by the lock.
        assert!(
            service
                .resolve_bearer(&first.bearer, Some("d1"))
                .await
                .is_err()
        );

        // Admin unlock restores access.
        service.unlock(first.user.id).await.unwrap();
        service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn relogin_same_device_keeps_single_active_device() {
        let service = service();
        let user = registered(&service, "u@x.y").await;

        service.login("u@x.y", "pw", &device("d1"), false).await.unwrap();
        service.login("u@x.y", "pw", &device("d1"), false).await.unwrap();

        let active: Vec<_> = service
            .devices(user.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn brute_force_triggers_backoff_lock() {
        let service = AuthService::new(
            Arc::new(MemoryStore::new()),
            LoginPolicy {
                max_failed_logins: 3,
                ..LoginPolicy::default()
            },
        );
        registered(&service, "u@x.y").await;

        for _ in 0..3 {
            let err = service
                .login("u@x.y", "wrong", &device("d1"), false)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredential));
        }

        // The lock applies even with the right password now.
        let err = service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Locked));
    }

    #[tokio::test]
    async fn logout_revokes_session_read_your_writes() {
        let service = service();
        registered(&service, "u@x.y").await;
        let login = service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap();

        service
            .resolve_bearer(&login.bearer, Some("d1"))
            .await
            .unwrap();
        service.logout(login.session.id).await.unwrap();

        let err = service
            .resolve_bearer(&login.bearer, Some("d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn device_header_mismatch_revokes_session() {
        let service = service();
        registered(&service, "u@x.y").await;
        let login = service
            .login("u@x.y", "pw", &device("d1"), false)
            .await
            .unwrap();

        let err = service
            .resolve_bearer(&login.bearer, Some("other-device"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DeviceMismatch));

        // The mismatch burned the session.
        let err = service
            .resolve_bearer(&login.bearer, Some("d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }
}
