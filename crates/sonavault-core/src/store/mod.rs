//! Entity store boundary.
//!
//! The relational store is an external collaborator; the server only needs
//! the CRUD surface below. [`MemoryStore`] is the in-process implementation
//! used by the test suites and single-node deployments. Every method is a
//! short-lived transaction: no handler holds store state across an await
//! other than the value it read.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::{Device, Session, User};
use crate::chapter::Chapter;
use crate::library::{AudioFile, Checkpoint, FileAccess};
use crate::upload::UploadSession;

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str) -> Self {
        StoreError::NotFound { entity }
    }
}

/// CRUD surface over the external entity store.
///
/// Reads are strongly consistent with preceding writes from any handler
/// (read-your-writes); the token pipeline relies on this for revocation.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------
    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    async fn user_by_id(&self, id: Uuid) -> Result<User, StoreError>;
    /// Case-insensitive email lookup.
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn update_user(&self, user: User) -> Result<(), StoreError>;
    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError>;
    async fn user_count(&self) -> Result<usize, StoreError>;

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------
    async fn insert_device(&self, device: Device) -> Result<(), StoreError>;
    async fn device_by_id(&self, id: Uuid) -> Result<Device, StoreError>;
    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError>;
    async fn update_device(&self, device: Device) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------
    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;
    async fn session_by_id(&self, id: Uuid) -> Result<Session, StoreError>;
    async fn session_by_token_hash(&self, hash: &str) -> Result<Option<Session>, StoreError>;
    async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError>;
    async fn update_session(&self, session: Session) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Audio files
    // ------------------------------------------------------------------
    async fn insert_file(&self, file: AudioFile) -> Result<(), StoreError>;
    async fn file_by_id(&self, id: Uuid) -> Result<AudioFile, StoreError>;
    async fn list_files(&self) -> Result<Vec<AudioFile>, StoreError>;
    async fn update_file(&self, file: AudioFile) -> Result<(), StoreError>;
    async fn delete_file(&self, id: Uuid) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Access grants
    // ------------------------------------------------------------------
    async fn insert_grant(&self, grant: FileAccess) -> Result<(), StoreError>;
    async fn grant_by_id(&self, id: Uuid) -> Result<FileAccess, StoreError>;
    async fn grants_for_file(&self, file_id: Uuid) -> Result<Vec<FileAccess>, StoreError>;
    async fn grant_for(&self, user_id: Uuid, file_id: Uuid)
    -> Result<Option<FileAccess>, StoreError>;
    async fn update_grant(&self, grant: FileAccess) -> Result<(), StoreError>;
    async fn delete_grant(&self, id: Uuid) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Chapters
    // ------------------------------------------------------------------
    /// Atomically replace the pending chapter set of a file. Failed
    /// chapters are replaced along with pending ones; ready chapters are
    /// untouched.
    async fn replace_pending_chapters(
        &self,
        file_id: Uuid,
        chapters: Vec<Chapter>,
    ) -> Result<(), StoreError>;
    /// Chapters of a file in ordinal order.
    async fn chapters_for_file(&self, file_id: Uuid) -> Result<Vec<Chapter>, StoreError>;
    async fn chapter_by_id(&self, id: Uuid) -> Result<Chapter, StoreError>;
    async fn update_chapter(&self, chapter: Chapter) -> Result<(), StoreError>;
    async fn delete_chapter(&self, id: Uuid) -> Result<(), StoreError>;
    async fn delete_chapters_for_file(&self, file_id: Uuid) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Upload sessions
    // ------------------------------------------------------------------
    async fn insert_upload(&self, upload: UploadSession) -> Result<(), StoreError>;
    async fn upload_by_id(&self, id: Uuid) -> Result<UploadSession, StoreError>;
    async fn update_upload(&self, upload: UploadSession) -> Result<(), StoreError>;
    /// Record a received chunk index atomically, so parallel chunk writes
    /// for one upload never lose each other's updates.
    async fn mark_chunk_received(&self, id: Uuid, index: u32) -> Result<(), StoreError>;
    async fn delete_upload(&self, id: Uuid) -> Result<(), StoreError>;
    async fn list_uploads(&self) -> Result<Vec<UploadSession>, StoreError>;

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------
    async fn upsert_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;
    async fn checkpoints_for(
        &self,
        user_id: Uuid,
        file_id: Uuid,
    ) -> Result<Vec<Checkpoint>, StoreError>;
    async fn delete_checkpoint(&self, id: Uuid) -> Result<(), StoreError>;
}
