//! Chapter management and finalization.
//!
//! [`ChapterCryptor`] owns the chapter lifecycle: boundary upserts,
//! per-file finalization (cut, encrypt, persist), and reader construction
//! for the streaming engine. Finalization for one file is mutually
//! exclusive and processes chapters in ordinal order; failures are recorded
//! per chapter and do not stop the batch.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{CryptoPool, RootKey};
use crate::library::AudioFile;
use crate::store::Store;

use super::cipher::{self, SegmentContext, SegmentScheme};
use super::reader::SegmentReader;
use super::{
    Chapter, ChapterDraft, ChapterError, ChapterStatus, ChapterStorage, KeyForm, byte_range,
    effective_end, sample_drafts, validate_drafts,
};

/// Where finalized segments are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Filesystem,
    Database,
}

/// Per-chapter failure record in a finalize summary.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeFailure {
    pub chapter_id: Uuid,
    pub label: String,
    pub code: String,
}

/// Result of a finalize batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FinalizeOutcome {
    pub finalized: usize,
    pub failed: usize,
    pub errors: Vec<FinalizeFailure>,
}

/// Fields an admin may change on a pending chapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChapterUpdate {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "startTime", default)]
    pub start_seconds: Option<f64>,
    #[serde(rename = "endTime", default)]
    pub end_seconds: Option<Option<f64>>,
}

/// The chapter encryption service.
pub struct ChapterCryptor {
    store: Arc<dyn Store>,
    root_key: Arc<RootKey>,
    pool: CryptoPool,
    storage_root: PathBuf,
    /// Per-file finalize mutexes: one finalization per file at a time.
    finalize_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ChapterCryptor {
    pub fn new(
        store: Arc<dyn Store>,
        root_key: Arc<RootKey>,
        pool: CryptoPool,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            root_key,
            pool,
            storage_root: storage_root.into(),
            finalize_locks: DashMap::new(),
        }
    }

    fn segment_path(&self, file_id: Uuid, chapter_id: Uuid) -> PathBuf {
        self.storage_root
            .join(file_id.to_string())
            .join(format!("{chapter_id}.enc"))
    }

    /// Chapters of a file in ordinal order.
    pub async fn list(&self, file_id: Uuid) -> Result<Vec<Chapter>, ChapterError> {
        Ok(self.store.chapters_for_file(file_id).await?)
    }

    pub async fn chapter(&self, id: Uuid) -> Result<Chapter, ChapterError> {
        match self.store.chapter_by_id(id).await {
            Ok(chapter) => Ok(chapter),
            Err(crate::store::StoreError::NotFound { .. }) => Err(ChapterError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the pending chapter set.
    ///
    /// Boundaries are validated against the file duration and the ready
    /// chapters; ordinals are recomputed over the combined set so the file's
    /// chapters stay strictly ordered by start time.
    #[instrument(level = "info", skip(self, drafts), fields(file_id = %file.id, drafts = drafts.len()))]
    pub async fn upsert(
        &self,
        file: &AudioFile,
        drafts: Vec<ChapterDraft>,
    ) -> Result<Vec<Chapter>, ChapterError> {
        let existing = self.store.chapters_for_file(file.id).await?;
        let kept: Vec<Chapter> = existing
            .into_iter()
            .filter(|c| c.status == ChapterStatus::Ready)
            .collect();

        validate_drafts(&drafts, &kept, file.duration_seconds)?;

        let mut pending: Vec<Chapter> = drafts
            .iter()
            .map(|d| Chapter::pending(file.id, 0, d))
            .collect();

        // Recompute ordinals across kept + new, ordered by start time.
        let mut all: Vec<&mut Chapter> = Vec::with_capacity(kept.len() + pending.len());
        let mut kept = kept;
        all.extend(kept.iter_mut());
        all.extend(pending.iter_mut());
        all.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
        for (ordinal, chapter) in all.iter_mut().enumerate() {
            chapter.ordinal = ordinal as u32;
        }

        self.store
            .replace_pending_chapters(file.id, pending.clone())
            .await?;
        for chapter in kept {
            self.store.update_chapter(chapter).await?;
        }

        self.store.chapters_for_file(file.id).await.map_err(Into::into)
    }

    /// Update a pending chapter's boundary or label.
    pub async fn update(
        &self,
        file: &AudioFile,
        chapter_id: Uuid,
        update: ChapterUpdate,
    ) -> Result<Chapter, ChapterError> {
        let mut chapter = self.chapter(chapter_id).await?;
        if chapter.status != ChapterStatus::Pending {
            return Err(ChapterError::DeleteReady(chapter_id));
        }

        if let Some(label) = update.label {
            chapter.label = label;
        }
        if let Some(start) = update.start_seconds {
            chapter.start_seconds = start;
        }
        if let Some(end) = update.end_seconds {
            chapter.end_seconds = end;
        }

        // Re-validate the chapter against its siblings.
        let siblings: Vec<Chapter> = self
            .store
            .chapters_for_file(file.id)
            .await?
            .into_iter()
            .filter(|c| c.id != chapter_id)
            .collect();
        let draft = ChapterDraft {
            label: chapter.label.clone(),
            start_seconds: chapter.start_seconds,
            end_seconds: chapter.end_seconds,
        };
        validate_drafts(std::slice::from_ref(&draft), &siblings, file.duration_seconds)?;

        self.store.update_chapter(chapter.clone()).await?;
        Ok(chapter)
    }

    /// Delete a chapter. Ready chapters require `reset = true`, which also
    /// removes the persisted ciphertext.
    pub async fn delete(&self, chapter_id: Uuid, reset: bool) -> Result<(), ChapterError> {
        let chapter = self.chapter(chapter_id).await?;
        if chapter.status == ChapterStatus::Ready && !reset {
            return Err(ChapterError::DeleteReady(chapter_id));
        }
        if let Some(ChapterStorage::Filesystem(path)) = &chapter.storage {
            let _ = tokio::fs::remove_file(path).await;
        }
        self.store.delete_chapter(chapter_id).await?;
        Ok(())
    }

    /// Populate the canonical demo boundaries for a file.
    pub async fn load_sample(&self, file: &AudioFile) -> Result<Vec<Chapter>, ChapterError> {
        self.upsert(file, sample_drafts(file.duration_seconds)).await
    }

    /// Encrypt every pending chapter of a file, in ordinal order.
    ///
    /// Holds the file's finalize mutex for the whole batch. A chapter that
    /// fails is marked `failed` with a stable code and the batch continues.
    #[instrument(level = "info", skip(self, file), fields(file_id = %file.id, ?storage))]
    pub async fn finalize_chapters(
        &self,
        file: &AudioFile,
        storage: StorageType,
    ) -> Result<FinalizeOutcome, ChapterError> {
        let lock = self
            .finalize_locks
            .entry(file.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if file.size == 0 {
            return Err(ChapterError::NoAudio(file.id));
        }

        let chapters = self.store.chapters_for_file(file.id).await?;
        let mut outcome = FinalizeOutcome::default();

        for index in 0..chapters.len() {
            if chapters[index].status != ChapterStatus::Pending {
                continue;
            }
            let chapter = chapters[index].clone();
            let end = effective_end(&chapters, index, file.duration_seconds);

            match self.seal_chapter(file, chapter.clone(), end, storage).await {
                Ok(()) => outcome.finalized += 1,
                Err(err) => {
                    warn!(chapter_id = %chapter.id, error = %err, "Chapter finalization failed");
                    let code = failure_code(&err);
                    let mut failed = chapter.clone();
                    failed.status = ChapterStatus::Failed;
                    failed.error_code = Some(code.clone());
                    self.store.update_chapter(failed).await?;

                    outcome.failed += 1;
                    outcome.errors.push(FinalizeFailure {
                        chapter_id: chapter.id,
                        label: chapter.label,
                        code,
                    });
                }
            }
        }

        info!(
            finalized = outcome.finalized,
            failed = outcome.failed,
            "Chapter finalize batch complete"
        );
        Ok(outcome)
    }

    /// Cut, encrypt, and persist one chapter.
    async fn seal_chapter(
        &self,
        file: &AudioFile,
        mut chapter: Chapter,
        end_seconds: f64,
        storage: StorageType,
    ) -> Result<(), ChapterError> {
        let (from, to) = byte_range(
            chapter.start_seconds,
            end_seconds,
            file.duration_seconds,
            file.size,
        );
        let plain_size = to - from;

        let mut source = tokio::fs::File::open(&file.storage_path).await?;
        source.seek(SeekFrom::Start(from)).await?;
        let mut plaintext = vec![0u8; plain_size as usize];
        source.read_exact(&mut plaintext).await?;

        // Filesystem chapters derive their key from the ids, so the disk
        // holds nothing but ciphertext. Inline chapters get a wrapped random
        // key stored beside the blob.
        let (data_key, key_form) = match storage {
            StorageType::Filesystem => (
                self.root_key.derive_chapter_key(file.id, chapter.id)?,
                KeyForm::Derived,
            ),
            StorageType::Database => {
                let mut fresh = Zeroizing::new([0u8; 32]);
                rand::RngCore::fill_bytes(&mut rand::rng(), fresh.as_mut_slice());
                let blob = self.root_key.wrap_data_key(&fresh)?;
                (fresh, KeyForm::Wrapped { blob })
            }
        };

        let context = SegmentContext::new().with_chapter(chapter.id);
        let key_bytes = Zeroizing::new(*data_key);
        let encrypted = self
            .pool
            .run(move || cipher::encrypt_segment(&plaintext, &key_bytes, &context))
            .await?;

        let encrypted_size = encrypted.len() as u64;
        let nonce_hex = hex::encode(&encrypted[cipher::PRELUDE_LEN..cipher::DATA_OFFSET]);

        let stored = match storage {
            StorageType::Filesystem => {
                let path = self.segment_path(file.id, chapter.id);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // Ciphertext files are immutable once published.
                let tmp = path.with_extension("enc.tmp");
                tokio::fs::write(&tmp, &encrypted).await?;
                tokio::fs::rename(&tmp, &path).await?;
                ChapterStorage::Filesystem(path)
            }
            StorageType::Database => ChapterStorage::Inline(encrypted),
        };

        chapter.status = ChapterStatus::Ready;
        chapter.storage = Some(stored);
        chapter.plain_size = Some(plain_size);
        chapter.encrypted_size = Some(encrypted_size);
        chapter.key_form = Some(key_form);
        chapter.scheme = Some(SegmentScheme::GcmFramed.as_str().to_string());
        chapter.nonce_hex = Some(nonce_hex);
        chapter.finalized_at = Some(Utc::now());
        chapter.error_code = None;
        self.store.update_chapter(chapter).await?;
        Ok(())
    }

    /// Recover a chapter's data key from its stored key form.
    pub fn data_key_for(&self, chapter: &Chapter) -> Result<Zeroizing<[u8; 32]>, ChapterError> {
        match &chapter.key_form {
            Some(KeyForm::Derived) => Ok(self
                .root_key
                .derive_chapter_key(chapter.file_id, chapter.id)?),
            Some(KeyForm::Wrapped { blob }) => Ok(self.root_key.unwrap_data_key(blob)?),
            None => Err(ChapterError::NotReady(chapter.id)),
        }
    }

    /// Open a streaming reader over a ready chapter's ciphertext.
    pub async fn open_reader(&self, chapter: &Chapter) -> Result<SegmentReader, ChapterError> {
        if chapter.status != ChapterStatus::Ready {
            return Err(ChapterError::NotReady(chapter.id));
        }
        let data_key = self.data_key_for(chapter)?;
        let context = SegmentContext::new().with_chapter(chapter.id);

        match chapter.storage.as_ref() {
            Some(ChapterStorage::Filesystem(path)) => {
                Ok(SegmentReader::open(path, &data_key, context).await?)
            }
            Some(ChapterStorage::Inline(blob)) => {
                Ok(SegmentReader::from_blob(blob.clone(), &data_key, context)?)
            }
            None => Err(ChapterError::NotReady(chapter.id)),
        }
    }

    /// Record a streaming-time decryption failure on the chapter row.
    pub async fn mark_failed(&self, chapter_id: Uuid, code: &str) -> Result<(), ChapterError> {
        let mut chapter = self.chapter(chapter_id).await?;
        chapter.status = ChapterStatus::Failed;
        chapter.error_code = Some(code.to_string());
        self.store.update_chapter(chapter).await?;
        warn!(%chapter_id, code, "Chapter marked failed");
        Ok(())
    }
}

fn failure_code(err: &ChapterError) -> String {
    match err {
        ChapterError::Io(_) => "IO_FAILED".to_string(),
        ChapterError::Crypto(_) | ChapterError::Encrypt(_) => "ENCRYPT_FAILED".to_string(),
        ChapterError::Decrypt(_) => "DECRYPT_FAILED".to_string(),
        _ => "FINALIZE_FAILED".to_string(),
    }
}
