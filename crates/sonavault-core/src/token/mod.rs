//! Short-lived stream credentials.
//!
//! All three credential forms are HS256 compact tokens over a canonical
//! claim set binding (type, file, optional chapter or time window, session,
//! device, expiry). They are opaque to clients and verifiable stand-alone:
//! the streaming engine needs only the signing key to validate one, and the
//! session-liveness re-check happens against the store on every redemption.
//!
//! Rotating the signing key invalidates every outstanding token; callers
//! must re-issue.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::SigningKeyCell;

/// Clock skew tolerated when validating `exp`, in seconds.
const EXP_LEEWAY_SECS: u64 = 5;

/// Sentinel meaning "stream to the end" in signed-URL requests.
pub const END_OF_FILE: f64 = -1.0;

#[derive(Error, Debug, PartialEq)]
pub enum TokenError {
    /// Bad MAC, malformed token, or claims that fail shape checks.
    #[error("invalid stream token")]
    InvalidToken,

    /// Structurally valid token past its expiry.
    #[error("stream token expired")]
    TokenExpired,

    /// Requested time window fails the issuance bounds.
    #[error("invalid time window: start {start}, end {end:?}")]
    InvalidWindow { start: f64, end: Option<f64> },

    #[error("token signing failed: {0}")]
    SigningFailed(String),
}

/// The three redeemable credential forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    /// Full-file streaming right.
    DrmSession,
    /// Seek-aligned partial stream over a time window.
    SignedUrl,
    /// Single-chapter stream.
    ChapterStream,
}

/// Canonical signed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamClaims {
    pub typ: TokenKind,
    /// File the token authorizes.
    pub fid: Uuid,
    /// Chapter binding (chapter-stream tokens only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cid: Option<Uuid>,
    /// Window start in seconds (signed URLs only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub st: Option<f64>,
    /// Window end in seconds; `None` means to end of file.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub et: Option<f64>,
    /// Issuing session.
    pub sid: Uuid,
    /// Device bound to the issuing session.
    pub did: Uuid,
    pub iat: u64,
    pub exp: u64,
}

/// Validate a requested window against the file duration at issuance time.
///
/// `end = -1` means "to end"; otherwise the end must lie after the start.
pub fn validate_window(
    duration: f64,
    start: f64,
    end: f64,
) -> Result<(f64, Option<f64>), TokenError> {
    if !(0.0..duration).contains(&start) {
        return Err(TokenError::InvalidWindow {
            start,
            end: Some(end),
        });
    }
    if (end - END_OF_FILE).abs() < f64::EPSILON {
        return Ok((start, None));
    }
    if end <= start {
        return Err(TokenError::InvalidWindow {
            start,
            end: Some(end),
        });
    }
    Ok((start, Some(end)))
}

/// Issues and validates stream credentials.
pub struct TokenMint {
    keys: Arc<SigningKeyCell>,
    default_ttl: Duration,
}

impl TokenMint {
    pub fn new(keys: Arc<SigningKeyCell>, default_ttl: Duration) -> Self {
        Self { keys, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn sign(&self, claims: &StreamClaims) -> Result<String, TokenError> {
        self.keys.with_secret(|secret| {
            jsonwebtoken::encode(
                &Header::new(Algorithm::HS256),
                claims,
                &EncodingKey::from_secret(secret),
            )
            .map_err(|e| TokenError::SigningFailed(e.to_string()))
        })
    }

    fn claims(
        &self,
        typ: TokenKind,
        file_id: Uuid,
        session_id: Uuid,
        device_id: Uuid,
        ttl: Option<Duration>,
    ) -> StreamClaims {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        StreamClaims {
            typ,
            fid: file_id,
            cid: None,
            st: None,
            et: None,
            sid: session_id,
            did: device_id,
            iat: now.timestamp() as u64,
            exp: (now + ttl).timestamp() as u64,
        }
    }

    /// Issue a full-file DRM session token.
    pub fn issue_session(
        &self,
        file_id: Uuid,
        session_id: Uuid,
        device_id: Uuid,
    ) -> Result<String, TokenError> {
        let claims = self.claims(TokenKind::DrmSession, file_id, session_id, device_id, None);
        self.sign(&claims)
    }

    /// Issue a signed-URL token over a validated time window.
    pub fn issue_signed_url(
        &self,
        file_id: Uuid,
        session_id: Uuid,
        device_id: Uuid,
        start: f64,
        end: Option<f64>,
        ttl: Option<Duration>,
    ) -> Result<String, TokenError> {
        let mut claims = self.claims(TokenKind::SignedUrl, file_id, session_id, device_id, ttl);
        claims.st = Some(start);
        claims.et = end;
        self.sign(&claims)
    }

    /// Issue a single-chapter stream token.
    pub fn issue_chapter(
        &self,
        file_id: Uuid,
        chapter_id: Uuid,
        session_id: Uuid,
        device_id: Uuid,
        ttl: Option<Duration>,
    ) -> Result<String, TokenError> {
        let mut claims = self.claims(TokenKind::ChapterStream, file_id, session_id, device_id, ttl);
        claims.cid = Some(chapter_id);
        self.sign(&claims)
    }

    /// Validate a token's MAC and expiry against wall-clock time.
    ///
    /// Field bindings (session, device, file) are the caller's to check
    /// against the resolved request identity.
    pub fn verify(&self, token: &str) -> Result<StreamClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = EXP_LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp"]);

        let outcome = self.keys.with_secret(|secret| {
            jsonwebtoken::decode::<StreamClaims>(
                token,
                &DecodingKey::from_secret(secret),
                &validation,
            )
        });

        match outcome {
            Ok(data) => {
                // Shape check: chapter tokens must carry a chapter, signed
                // URLs a window.
                let claims = data.claims;
                let well_formed = match claims.typ {
                    TokenKind::DrmSession => true,
                    TokenKind::SignedUrl => claims.st.is_some(),
                    TokenKind::ChapterStream => claims.cid.is_some(),
                };
                if !well_formed {
                    return Err(TokenError::InvalidToken);
                }
                Ok(claims)
            }
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => {
                    debug!("Stream token expired");
                    Err(TokenError::TokenExpired)
                }
                _ => Err(TokenError::InvalidToken),
            },
        }
    }
}
