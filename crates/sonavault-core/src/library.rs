//! Audio files, access grants, and per-user checkpoints.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who may discover a file without an explicit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Cover art, stored on disk next to the audio or inlined as base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverImage {
    Path(PathBuf),
    Inline(String),
}

/// An ingested audio original.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub id: Uuid,
    pub title: String,
    pub uploader_id: Uuid,
    /// SHA-256 of the stored bytes, hex. Always matches the bytes on disk.
    pub sha256: String,
    pub size: u64,
    pub mime_type: String,
    pub duration_seconds: f64,
    pub visibility: Visibility,
    pub cover: Option<CoverImage>,
    /// Location of the original bytes under the media root.
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A (user, file) viewing grant.
#[derive(Debug, Clone)]
pub struct FileAccess {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub can_view: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
}

impl FileAccess {
    /// Whether this grant currently authorizes viewing.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.can_view && self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// Per-user, per-file playback bookmark. No security role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub position_seconds: f64,
    pub label: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}
