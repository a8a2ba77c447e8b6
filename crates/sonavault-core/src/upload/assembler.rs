//! Resumable upload assembly.
//!
//! Chunks land as individual files in a per-session workspace directory and
//! are concatenated, hash-verified, and promoted to durable storage at
//! finalize time. Chunk writes are atomic (write-temp + rename) and
//! idempotent per index; finalization is mutually exclusive per upload id
//! but uploads never serialize against each other.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::crypto::CryptoPool;
use crate::library::{AudioFile, CoverImage, Visibility};
use crate::store::Store;

use super::{UploadError, UploadSession, UploadState};

/// Copy buffer for assembly and chunk comparison.
const COPY_BUF: usize = 64 * 1024;

/// Attempts for transient IO failures before surfacing them.
const IO_RETRIES: u32 = 3;
/// Base backoff between IO retries.
const IO_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Covers up to this size are inlined as base64; larger ones go to disk.
const INLINE_COVER_LIMIT: usize = 1024 * 1024;

/// Duration resolution seam. The real format probe is an external
/// collaborator; the default implementation trusts the declared metadata.
pub trait DurationProbe: Send + Sync + 'static {
    fn probe(&self, path: &Path, declared: Option<f64>) -> Result<f64, UploadError>;
}

/// Probe that accepts the client-declared duration.
#[derive(Debug, Default)]
pub struct DeclaredDuration;

impl DurationProbe for DeclaredDuration {
    fn probe(&self, _path: &Path, declared: Option<f64>) -> Result<f64, UploadError> {
        match declared {
            Some(duration) if duration > 0.0 => Ok(duration),
            Some(duration) => Err(UploadError::DurationUnavailable(format!(
                "declared duration {duration} is not positive"
            ))),
            None => Err(UploadError::DurationUnavailable(
                "no duration declared and probing is delegated".to_string(),
            )),
        }
    }
}

/// Parameters for creating a new upload session.
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub expected_sha256: String,
    pub mime_type: String,
    pub title: Option<String>,
}

/// Finalization metadata supplied with the finalize call.
#[derive(Debug, Clone, Default)]
pub struct FinalizeRequest {
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
    pub visibility: Option<Visibility>,
    /// Raw cover image bytes, if one was attached.
    pub cover: Option<Vec<u8>>,
}

/// The chunked upload service.
pub struct UploadAssembler {
    store: Arc<dyn Store>,
    pool: CryptoPool,
    probe: Arc<dyn DurationProbe>,
    /// Root for workspaces (`uploads/{id}/`), originals, and covers.
    media_root: PathBuf,
    max_chunk_bytes: u64,
    ttl: Duration,
    /// Per-upload finalize mutexes. Entries are cheap and reclaimed with
    /// the session.
    finalize_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl UploadAssembler {
    pub fn new(
        store: Arc<dyn Store>,
        pool: CryptoPool,
        media_root: impl Into<PathBuf>,
        max_chunk_bytes: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            probe: Arc::new(DeclaredDuration),
            media_root: media_root.into(),
            max_chunk_bytes,
            ttl,
            finalize_locks: DashMap::new(),
        }
    }

    /// Replace the duration probe (used when a real format probe is wired in).
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DurationProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn workspace_for(&self, id: Uuid) -> PathBuf {
        self.media_root.join("uploads").join(id.to_string())
    }

    fn original_path(&self, file_id: Uuid) -> PathBuf {
        self.media_root.join("originals").join(file_id.to_string())
    }

    /// Create a session and allocate its workspace.
    #[instrument(level = "info", skip(self, request), fields(file_name = %request.file_name))]
    pub async fn init(
        &self,
        uploader_id: Uuid,
        request: InitRequest,
    ) -> Result<UploadSession, UploadError> {
        if request.total_chunks == 0 || request.total_size == 0 {
            return Err(UploadError::SizeMismatch {
                expected: request.total_size,
                actual: 0,
            });
        }

        let id = Uuid::new_v4();
        let workspace = self.workspace_for(id);
        tokio::fs::create_dir_all(&workspace).await?;

        let now = Utc::now();
        let session = UploadSession {
            id,
            uploader_id,
            file_name: request.file_name,
            total_size: request.total_size,
            total_chunks: request.total_chunks,
            expected_sha256: request.expected_sha256.to_lowercase(),
            mime_type: request.mime_type,
            title: request.title,
            received: BTreeSet::new(),
            workspace,
            state: UploadState::Open,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_upload(session.clone()).await?;

        info!(upload_id = %id, total_chunks = session.total_chunks, "Upload session opened");
        Ok(session)
    }

    /// Load a session, expiring it first when past its TTL.
    async fn load_open(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let mut session = match self.store.upload_by_id(id).await {
            Ok(session) => session,
            Err(crate::store::StoreError::NotFound { .. }) => {
                return Err(UploadError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        };

        if session.state == UploadState::Open && Utc::now() - session.created_at > self.ttl {
            session.state = UploadState::Expired;
            session.updated_at = Utc::now();
            self.store.update_upload(session.clone()).await?;
            warn!(upload_id = %id, "Upload session expired on access");
            return Err(UploadError::Expired(id));
        }

        match session.state {
            UploadState::Open => Ok(session),
            UploadState::Expired => Err(UploadError::Expired(id)),
            state => Err(UploadError::InvalidState { id, state }),
        }
    }

    /// Write one chunk. Repeats of identical bytes succeed; repeats with
    /// different bytes fail with `ChunkConflict`.
    #[instrument(level = "debug", skip(self, bytes), fields(upload_id = %id, chunk = index, len = bytes.len()))]
    pub async fn put_chunk(&self, id: Uuid, index: u32, bytes: &[u8]) -> Result<(), UploadError> {
        if bytes.len() as u64 > self.max_chunk_bytes {
            return Err(UploadError::ChunkTooLarge {
                size: bytes.len() as u64,
                limit: self.max_chunk_bytes,
            });
        }

        let session = self.load_open(id).await?;
        if index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index,
                total: session.total_chunks,
            });
        }

        let final_path = session.workspace.join(index.to_string());
        if session.received.contains(&index) {
            // Idempotent repeat: accept identical bytes, reject a rewrite.
            let existing = tokio::fs::read(&final_path).await?;
            if existing == bytes {
                debug!("Identical chunk re-received");
                return Ok(());
            }
            return Err(UploadError::ChunkConflict { index });
        }

        // Atomic publication: a crashed write leaves only a temp file, which
        // the sweeper reclaims with the workspace. Transient IO failures are
        // retried with backoff before surfacing.
        let tmp_path = session.workspace.join(format!("{index}.part"));
        write_with_retry(&tmp_path, &final_path, bytes).await?;

        // Atomic index recording: chunks of one upload land in parallel.
        self.store.mark_chunk_received(id, index).await?;
        Ok(())
    }

    /// Received chunk indices, for client resume.
    pub async fn status(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.load_open(id).await
    }

    /// Verify, assemble, and promote an upload into an [`AudioFile`].
    #[instrument(level = "info", skip(self, request), fields(upload_id = %id))]
    pub async fn finalize(
        &self,
        id: Uuid,
        request: FinalizeRequest,
    ) -> Result<AudioFile, UploadError> {
        let lock = self
            .finalize_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut session = self.load_open(id).await?;
        session.state = UploadState::Finalizing;
        session.updated_at = Utc::now();
        self.store.update_upload(session.clone()).await?;

        match self.run_finalize(&mut session, request).await {
            Ok(file) => {
                session.state = UploadState::Completed;
                session.updated_at = Utc::now();
                self.store.update_upload(session.clone()).await?;
                let _ = tokio::fs::remove_dir_all(&session.workspace).await;
                self.finalize_locks.remove(&id);
                info!(file_id = %file.id, size = file.size, "Upload finalized");
                Ok(file)
            }
            Err(err) => {
                let unrecoverable = matches!(
                    err,
                    UploadError::IntegrityFailed { .. } | UploadError::SizeMismatch { .. }
                );
                session.state = if unrecoverable {
                    UploadState::Aborted
                } else {
                    UploadState::Open
                };
                session.updated_at = Utc::now();
                self.store.update_upload(session.clone()).await?;
                if unrecoverable {
                    let _ = tokio::fs::remove_dir_all(&session.workspace).await;
                    warn!(upload_id = %id, error = %err, "Upload aborted: integrity failure");
                }
                Err(err)
            }
        }
    }

    async fn run_finalize(
        &self,
        session: &mut UploadSession,
        request: FinalizeRequest,
    ) -> Result<AudioFile, UploadError> {
        let missing = session.total_chunks - session.received.len() as u32;
        if missing > 0 {
            return Err(UploadError::ChunksMissing {
                missing,
                total: session.total_chunks,
            });
        }

        let file_id = Uuid::new_v4();
        let dest = self.original_path(file_id);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Concatenate + hash on the bounded blocking pool; this is the one
        // long CPU stretch in the upload path.
        let workspace = session.workspace.clone();
        let total_chunks = session.total_chunks;
        let tmp_dest = dest.with_extension("tmp");
        let assemble_dest = tmp_dest.clone();
        let (actual_sha256, actual_size) = self
            .pool
            .run(move || assemble_and_hash(&workspace, total_chunks, &assemble_dest))
            .await?;

        if actual_sha256 != session.expected_sha256 {
            let _ = tokio::fs::remove_file(&tmp_dest).await;
            return Err(UploadError::IntegrityFailed {
                expected: session.expected_sha256.clone(),
                actual: actual_sha256,
            });
        }
        if actual_size != session.total_size {
            let _ = tokio::fs::remove_file(&tmp_dest).await;
            return Err(UploadError::SizeMismatch {
                expected: session.total_size,
                actual: actual_size,
            });
        }

        let duration = self.probe.probe(&tmp_dest, request.duration_seconds)?;
        tokio::fs::rename(&tmp_dest, &dest).await?;

        let cover = match request.cover {
            Some(bytes) => Some(self.store_cover(file_id, bytes).await?),
            None => None,
        };

        let file = AudioFile {
            id: file_id,
            title: request
                .title
                .or_else(|| session.title.clone())
                .unwrap_or_else(|| session.file_name.clone()),
            uploader_id: session.uploader_id,
            sha256: actual_sha256,
            size: actual_size,
            mime_type: session.mime_type.clone(),
            duration_seconds: duration,
            visibility: request.visibility.unwrap_or(Visibility::Private),
            cover,
            storage_path: dest,
            created_at: Utc::now(),
        };
        self.store.insert_file(file.clone()).await?;
        Ok(file)
    }

    async fn store_cover(&self, file_id: Uuid, bytes: Vec<u8>) -> Result<CoverImage, UploadError> {
        use base64::Engine as _;

        if bytes.len() <= INLINE_COVER_LIMIT {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            return Ok(CoverImage::Inline(encoded));
        }
        let path = self.media_root.join("covers").join(file_id.to_string());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        Ok(CoverImage::Path(path))
    }

    /// Abort a session and purge its workspace.
    #[instrument(level = "info", skip(self), fields(upload_id = %id))]
    pub async fn abort(&self, id: Uuid) -> Result<(), UploadError> {
        let mut session = self.load_open(id).await?;
        session.state = UploadState::Aborted;
        session.updated_at = Utc::now();
        self.store.update_upload(session.clone()).await?;
        let _ = tokio::fs::remove_dir_all(&session.workspace).await;
        self.finalize_locks.remove(&id);
        Ok(())
    }

    /// Expire overdue sessions and reclaim workspaces of dead ones.
    /// Returns the number of workspaces removed.
    pub async fn sweep(&self) -> Result<usize, UploadError> {
        let now = Utc::now();
        let mut reclaimed = 0;

        for mut session in self.store.list_uploads().await? {
            if session.state == UploadState::Open && now - session.created_at > self.ttl {
                session.state = UploadState::Expired;
                session.updated_at = now;
                self.store.update_upload(session.clone()).await?;
            }
            if matches!(session.state, UploadState::Expired | UploadState::Aborted)
                && session.workspace.exists()
            {
                tokio::fs::remove_dir_all(&session.workspace).await?;
                self.finalize_locks.remove(&session.id);
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            debug!(reclaimed, "Upload sweeper reclaimed workspaces");
        }
        Ok(reclaimed)
    }
}

/// Write-temp + rename with bounded retries on transient IO errors.
async fn write_with_retry(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<(), UploadError> {
    let mut attempt = 0;
    loop {
        let outcome = async {
            tokio::fs::write(tmp, bytes).await?;
            tokio::fs::rename(tmp, dest).await
        }
        .await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 < IO_RETRIES => {
                attempt += 1;
                warn!(attempt, error = %err, "Chunk write failed; retrying");
                tokio::time::sleep(IO_RETRY_BACKOFF * attempt).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Concatenate workspace chunks in index order into `dest`, returning the
/// hex SHA-256 and total size. Synchronous; callers run it on the blocking
/// pool.
fn assemble_and_hash(
    workspace: &Path,
    total_chunks: u32,
    dest: &Path,
) -> Result<(String, u64), UploadError> {
    let mut hasher = Sha256::new();
    let mut out = std::io::BufWriter::new(std::fs::File::create(dest)?);
    let mut total: u64 = 0;
    let mut buf = vec![0u8; COPY_BUF];

    for index in 0..total_chunks {
        let mut chunk = std::fs::File::open(workspace.join(index.to_string()))?;
        loop {
            let n = chunk.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
    out.flush()?;

    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn assembler(root: &Path) -> UploadAssembler {
        UploadAssembler::new(
            Arc::new(MemoryStore::new()),
            CryptoPool::new(2),
            root,
            5 * 1024 * 1024,
            Duration::hours(1),
        )
    }

    fn init_request(content: &[u8], chunks: u32) -> InitRequest {
        InitRequest {
            file_name: "episode.mp3".to_string(),
            total_size: content.len() as u64,
            total_chunks: chunks,
            expected_sha256: sha256_hex(content),
            mime_type: "audio/mpeg".to_string(),
            title: Some("Episode".to_string()),
        }
    }

    fn finalize_request() -> FinalizeRequest {
        FinalizeRequest {
            duration_seconds: Some(60.0),
            ..FinalizeRequest::default()
        }
    }

    #[tokio::test]
    async fn out_of_order_upload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());

        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = content.chunks(100_000).collect();

        let session = assembler
            .init(Uuid::new_v4(), init_request(&content, 3))
            .await
            .unwrap();

        assembler.put_chunk(session.id, 2, chunks[2]).await.unwrap();
        assembler.put_chunk(session.id, 0, chunks[0]).await.unwrap();

        let status = assembler.status(session.id).await.unwrap();
        assert_eq!(status.received.iter().copied().collect::<Vec<_>>(), vec![0, 2]);

        assembler.put_chunk(session.id, 1, chunks[1]).await.unwrap();
        let file = assembler
            .finalize(session.id, finalize_request())
            .await
            .unwrap();

        assert_eq!(file.size, content.len() as u64);
        assert_eq!(file.sha256, sha256_hex(&content));
        assert_eq!(tokio::fs::read(&file.storage_path).await.unwrap(), content);
        assert!(!session.workspace.exists());
    }

    #[tokio::test]
    async fn identical_chunk_repeat_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        let content = vec![9u8; 1000];

        let session = assembler
            .init(Uuid::new_v4(), init_request(&content, 1))
            .await
            .unwrap();
        assembler.put_chunk(session.id, 0, &content).await.unwrap();
        assembler.put_chunk(session.id, 0, &content).await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_chunk_repeat_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        let content = vec![9u8; 1000];

        let session = assembler
            .init(Uuid::new_v4(), init_request(&content, 1))
            .await
            .unwrap();
        assembler.put_chunk(session.id, 0, &content).await.unwrap();

        let err = assembler
            .put_chunk(session.id, 0, &vec![8u8; 1000])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunkConflict { index: 0 }));
    }

    #[tokio::test]
    async fn finalize_with_missing_chunks_stays_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        let content = vec![1u8; 2000];

        let session = assembler
            .init(Uuid::new_v4(), init_request(&content, 2))
            .await
            .unwrap();
        assembler.put_chunk(session.id, 0, &content[..1000]).await.unwrap();

        let err = assembler
            .finalize(session.id, finalize_request())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ChunksMissing { missing: 1, total: 2 }));

        // Recoverable: the missing chunk can still be supplied.
        assembler.put_chunk(session.id, 1, &content[1000..]).await.unwrap();
        assembler
            .finalize(session.id, finalize_request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hash_mismatch_aborts_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        let content = vec![1u8; 1000];

        let mut request = init_request(&content, 1);
        request.expected_sha256 = sha256_hex(b"something else");
        let session = assembler.init(Uuid::new_v4(), request).await.unwrap();
        assembler.put_chunk(session.id, 0, &content).await.unwrap();

        let err = assembler
            .finalize(session.id, finalize_request())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::IntegrityFailed { .. }));

        // The session is terminal now.
        let err = assembler
            .finalize(session.id, finalize_request())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidState { state: UploadState::Aborted, .. }
        ));
    }

    #[tokio::test]
    async fn expired_sessions_never_resurrect() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let assembler = UploadAssembler::new(
            Arc::clone(&store),
            CryptoPool::new(1),
            dir.path(),
            1024,
            Duration::milliseconds(0),
        );

        let content = vec![5u8; 10];
        let session = assembler
            .init(Uuid::new_v4(), init_request(&content, 1))
            .await
            .unwrap();

        let err = assembler.put_chunk(session.id, 0, &content).await.unwrap_err();
        assert!(matches!(err, UploadError::Expired(_)));

        let swept = assembler.sweep().await.unwrap();
        assert_eq!(swept, 1);
        assert!(!session.workspace.exists());
    }
}
