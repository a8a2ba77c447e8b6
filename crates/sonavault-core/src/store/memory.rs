//! In-process entity store backed by concurrent maps.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::auth::{Device, Session, User};
use crate::chapter::{Chapter, ChapterStatus};
use crate::library::{AudioFile, Checkpoint, FileAccess};
use crate::upload::UploadSession;

use super::{Store, StoreError};

/// DashMap-backed [`Store`] implementation.
///
/// Writes publish before the method returns, which gives the read-your-writes
/// guarantee the trait documents for free.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    /// Lower-cased email -> user id.
    emails: DashMap<String, Uuid>,
    devices: DashMap<Uuid, Device>,
    sessions: DashMap<Uuid, Session>,
    /// Bearer token hash -> session id.
    session_tokens: DashMap<String, Uuid>,
    files: DashMap<Uuid, AudioFile>,
    grants: DashMap<Uuid, FileAccess>,
    chapters: DashMap<Uuid, Chapter>,
    uploads: DashMap<Uuid, UploadSession>,
    checkpoints: DashMap<Uuid, Checkpoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let email = user.email.to_lowercase();
        if self.emails.contains_key(&email) {
            return Err(StoreError::Conflict(format!("email {email} already registered")));
        }
        self.emails.insert(email, user.id);
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::not_found("user"))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let id = self.emails.get(&email.to_lowercase()).map(|e| *e);
        Ok(id.and_then(|id| self.users.get(&id).map(|u| u.clone())))
    }

    async fn update_user(&self, user: User) -> Result<(), StoreError> {
        match self.users.get_mut(&user.id) {
            Some(mut slot) => {
                if !slot.email.eq_ignore_ascii_case(&user.email) {
                    self.emails.remove(&slot.email.to_lowercase());
                    self.emails.insert(user.email.to_lowercase(), user.id);
                }
                *slot = user;
                Ok(())
            }
            None => Err(StoreError::not_found("user")),
        }
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let (_, user) = self.users.remove(&id).ok_or_else(|| StoreError::not_found("user"))?;
        self.emails.remove(&user.email.to_lowercase());
        self.devices.retain(|_, d| d.user_id != id);
        self.sessions.retain(|_, s| s.user_id != id);
        self.session_tokens
            .retain(|_, sid| self.sessions.contains_key(sid));
        self.checkpoints.retain(|_, c| c.user_id != id);
        Ok(())
    }

    async fn user_count(&self) -> Result<usize, StoreError> {
        Ok(self.users.len())
    }

    async fn insert_device(&self, device: Device) -> Result<(), StoreError> {
        self.devices.insert(device.id, device);
        Ok(())
    }

    async fn device_by_id(&self, id: Uuid) -> Result<Device, StoreError> {
        self.devices
            .get(&id)
            .map(|d| d.clone())
            .ok_or_else(|| StoreError::not_found("device"))
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.clone())
            .collect();
        devices.sort_by_key(|d| d.first_seen);
        Ok(devices)
    }

    async fn update_device(&self, device: Device) -> Result<(), StoreError> {
        match self.devices.get_mut(&device.id) {
            Some(mut slot) => {
                *slot = device;
                Ok(())
            }
            None => Err(StoreError::not_found("device")),
        }
    }

    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        self.session_tokens
            .insert(session.token_hash.clone(), session.id);
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn session_by_id(&self, id: Uuid) -> Result<Session, StoreError> {
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| StoreError::not_found("session"))
    }

    async fn session_by_token_hash(&self, hash: &str) -> Result<Option<Session>, StoreError> {
        let id = self.session_tokens.get(hash).map(|s| *s);
        Ok(id.and_then(|id| self.sessions.get(&id).map(|s| s.clone())))
    }

    async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by_key(|s| s.issued_at);
        Ok(sessions)
    }

    async fn update_session(&self, session: Session) -> Result<(), StoreError> {
        match self.sessions.get_mut(&session.id) {
            Some(mut slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(StoreError::not_found("session")),
        }
    }

    async fn insert_file(&self, file: AudioFile) -> Result<(), StoreError> {
        self.files.insert(file.id, file);
        Ok(())
    }

    async fn file_by_id(&self, id: Uuid) -> Result<AudioFile, StoreError> {
        self.files
            .get(&id)
            .map(|f| f.clone())
            .ok_or_else(|| StoreError::not_found("file"))
    }

    async fn list_files(&self) -> Result<Vec<AudioFile>, StoreError> {
        let mut files: Vec<AudioFile> = self.files.iter().map(|f| f.clone()).collect();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }

    async fn update_file(&self, file: AudioFile) -> Result<(), StoreError> {
        match self.files.get_mut(&file.id) {
            Some(mut slot) => {
                *slot = file;
                Ok(())
            }
            None => Err(StoreError::not_found("file")),
        }
    }

    async fn delete_file(&self, id: Uuid) -> Result<(), StoreError> {
        self.files
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("file"))?;
        self.chapters.retain(|_, c| c.file_id != id);
        self.grants.retain(|_, g| g.file_id != id);
        self.checkpoints.retain(|_, c| c.file_id != id);
        Ok(())
    }

    async fn insert_grant(&self, grant: FileAccess) -> Result<(), StoreError> {
        self.grants.insert(grant.id, grant);
        Ok(())
    }

    async fn grant_by_id(&self, id: Uuid) -> Result<FileAccess, StoreError> {
        self.grants
            .get(&id)
            .map(|g| g.clone())
            .ok_or_else(|| StoreError::not_found("grant"))
    }

    async fn grants_for_file(&self, file_id: Uuid) -> Result<Vec<FileAccess>, StoreError> {
        let mut grants: Vec<FileAccess> = self
            .grants
            .iter()
            .filter(|g| g.file_id == file_id)
            .map(|g| g.clone())
            .collect();
        grants.sort_by_key(|g| g.granted_at);
        Ok(grants)
    }

    async fn grant_for(
        &self,
        user_id: Uuid,
        file_id: Uuid,
    ) -> Result<Option<FileAccess>, StoreError> {
        Ok(self
            .grants
            .iter()
            .find(|g| g.user_id == user_id && g.file_id == file_id)
            .map(|g| g.clone()))
    }

    async fn update_grant(&self, grant: FileAccess) -> Result<(), StoreError> {
        match self.grants.get_mut(&grant.id) {
            Some(mut slot) => {
                *slot = grant;
                Ok(())
            }
            None => Err(StoreError::not_found("grant")),
        }
    }

    async fn delete_grant(&self, id: Uuid) -> Result<(), StoreError> {
        self.grants
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("grant"))
    }

    async fn replace_pending_chapters(
        &self,
        file_id: Uuid,
        chapters: Vec<Chapter>,
    ) -> Result<(), StoreError> {
        self.chapters
            .retain(|_, c| c.file_id != file_id || c.status == ChapterStatus::Ready);
        for chapter in chapters {
            self.chapters.insert(chapter.id, chapter);
        }
        Ok(())
    }

    async fn chapters_for_file(&self, file_id: Uuid) -> Result<Vec<Chapter>, StoreError> {
        let mut chapters: Vec<Chapter> = self
            .chapters
            .iter()
            .filter(|c| c.file_id == file_id)
            .map(|c| c.clone())
            .collect();
        chapters.sort_by_key(|c| c.ordinal);
        Ok(chapters)
    }

    async fn chapter_by_id(&self, id: Uuid) -> Result<Chapter, StoreError> {
        self.chapters
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| StoreError::not_found("chapter"))
    }

    async fn update_chapter(&self, chapter: Chapter) -> Result<(), StoreError> {
        match self.chapters.get_mut(&chapter.id) {
            Some(mut slot) => {
                *slot = chapter;
                Ok(())
            }
            None => Err(StoreError::not_found("chapter")),
        }
    }

    async fn delete_chapter(&self, id: Uuid) -> Result<(), StoreError> {
        self.chapters
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("chapter"))
    }

    async fn delete_chapters_for_file(&self, file_id: Uuid) -> Result<(), StoreError> {
        self.chapters.retain(|_, c| c.file_id != file_id);
        Ok(())
    }

    async fn insert_upload(&self, upload: UploadSession) -> Result<(), StoreError> {
        self.uploads.insert(upload.id, upload);
        Ok(())
    }

    async fn upload_by_id(&self, id: Uuid) -> Result<UploadSession, StoreError> {
        self.uploads
            .get(&id)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::not_found("upload"))
    }

    async fn update_upload(&self, upload: UploadSession) -> Result<(), StoreError> {
        match self.uploads.get_mut(&upload.id) {
            Some(mut slot) => {
                *slot = upload;
                Ok(())
            }
            None => Err(StoreError::not_found("upload")),
        }
    }

    async fn mark_chunk_received(&self, id: Uuid, index: u32) -> Result<(), StoreError> {
        match self.uploads.get_mut(&id) {
            Some(mut slot) => {
                slot.received.insert(index);
                slot.updated_at = chrono::Utc::now();
                Ok(())
            }
            None => Err(StoreError::not_found("upload")),
        }
    }

    async fn delete_upload(&self, id: Uuid) -> Result<(), StoreError> {
        self.uploads
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("upload"))
    }

    async fn list_uploads(&self) -> Result<Vec<UploadSession>, StoreError> {
        Ok(self.uploads.iter().map(|u| u.clone()).collect())
    }

    async fn upsert_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.checkpoints.insert(checkpoint.id, checkpoint);
        Ok(())
    }

    async fn checkpoints_for(
        &self,
        user_id: Uuid,
        file_id: Uuid,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.user_id == user_id && c.file_id == file_id)
            .map(|c| c.clone())
            .collect();
        checkpoints.sort_by(|a, b| a.position_seconds.total_cmp(&b.position_seconds));
        Ok(checkpoints)
    }

    async fn delete_checkpoint(&self, id: Uuid) -> Result<(), StoreError> {
        self.checkpoints
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("checkpoint"))
    }
}
