//! Chunked, resumable upload of audio originals.

pub mod assembler;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub use assembler::{
    DeclaredDuration, DurationProbe, FinalizeRequest, InitRequest, UploadAssembler,
};

/// Upload session lifecycle. Transitions are monotone: `Expired`,
/// `Aborted`, and `Completed` are terminal, and an expired session never
/// resurrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Open,
    Finalizing,
    Completed,
    Aborted,
    Expired,
}

impl UploadState {
    /// Whether moving to `next` respects the monotone lifecycle.
    pub fn can_transition(self, next: UploadState) -> bool {
        use UploadState::{Aborted, Completed, Expired, Finalizing, Open};
        matches!(
            (self, next),
            (Open, Finalizing | Aborted | Expired)
                | (Finalizing, Completed | Open | Aborted)
        )
    }
}

/// A resumable upload in progress.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub uploader_id: Uuid,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// SHA-256 the assembled file must hash to, hex.
    pub expected_sha256: String,
    pub mime_type: String,
    pub title: Option<String>,
    /// Chunk indices received so far.
    pub received: BTreeSet<u32>,
    /// Reassembly workspace, owned exclusively by this session.
    pub workspace: PathBuf,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload {0} not found")]
    NotFound(Uuid),

    /// A chunk index was re-sent with different bytes.
    #[error("chunk {index} conflicts with previously received bytes")]
    ChunkConflict { index: u32 },

    /// Chunk index outside `[0, total_chunks)`.
    #[error("chunk index {index} out of range (expected < {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    /// A single chunk exceeded the configured size limit.
    #[error("chunk of {size} bytes exceeds limit of {limit}")]
    ChunkTooLarge { size: u64, limit: u64 },

    /// The assembled bytes did not hash to the declared SHA-256.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailed { expected: String, actual: String },

    /// Assembled size did not match the declared total size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Finalize called while chunks are missing.
    #[error("{missing} of {total} chunks missing")]
    ChunksMissing { missing: u32, total: u32 },

    /// The session passed its TTL.
    #[error("upload {0} expired")]
    Expired(Uuid),

    /// The session is in a state that does not permit the operation.
    #[error("upload {id} is {state:?}")]
    InvalidState { id: Uuid, state: UploadState },

    /// The declared duration was missing or non-positive.
    #[error("cannot determine audio duration: {0}")]
    DurationUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error in upload workspace: {0}")]
    Io(#[from] std::io::Error),
}
