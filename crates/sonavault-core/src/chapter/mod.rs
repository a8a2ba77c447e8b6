//! Chapters: the unit of at-rest encryption and streaming authorization.
//!
//! A chapter is a named, time-bounded slice of an audio file. Pending
//! chapters carry only boundaries; finalization (see [`finalize`]) encrypts
//! the corresponding byte range and fills in the crypto metadata. Ready
//! chapters are independently decryptable: root key + the row's metadata is
//! always sufficient, no chapter depends on another.

pub mod cipher;
pub mod finalize;
pub mod reader;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::store::StoreError;

pub use cipher::{SegmentContext, SegmentDecryptError, SegmentEncryptError, SegmentScheme};
pub use finalize::{ChapterCryptor, ChapterUpdate, FinalizeFailure, FinalizeOutcome, StorageType};
pub use reader::SegmentReader;

/// Lifecycle state of a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    Pending,
    Ready,
    Failed,
}

/// Where a ready chapter's ciphertext lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterStorage {
    /// Segment file under `CHAPTER_STORAGE_ROOT/{file_id}/{chapter_id}.enc`.
    Filesystem(PathBuf),
    /// Segment blob inlined in the entity store.
    Inline(Vec<u8>),
}

/// How the chapter's data key is obtained from the root key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyForm {
    /// HKDF-SHA256 derivation from (root key, chapter id, file id).
    Derived,
    /// Random key wrapped with the root key; the blob is the wrap output.
    Wrapped { blob: Vec<u8> },
}

impl KeyForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyForm::Derived => "derived",
            KeyForm::Wrapped { .. } => "wrapped",
        }
    }
}

/// A chapter row.
#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: Uuid,
    pub file_id: Uuid,
    /// Position within the file's chapter list, assigned from start order.
    pub ordinal: u32,
    pub label: String,
    pub start_seconds: f64,
    /// `None` means "until the next chapter starts, or end of file".
    pub end_seconds: Option<f64>,
    pub status: ChapterStatus,
    pub storage: Option<ChapterStorage>,
    pub plain_size: Option<u64>,
    pub encrypted_size: Option<u64>,
    pub key_form: Option<KeyForm>,
    /// Scheme tag copied from the segment prelude (`gcm-framed-v1`).
    pub scheme: Option<String>,
    /// Segment nonce, duplicated into the row for operator inspection.
    pub nonce_hex: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
    /// Stable error code recorded when finalization or streaming failed.
    pub error_code: Option<String>,
}

impl Chapter {
    /// Build a pending chapter from a draft boundary.
    pub fn pending(file_id: Uuid, ordinal: u32, draft: &ChapterDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_id,
            ordinal,
            label: draft.label.clone(),
            start_seconds: draft.start_seconds,
            end_seconds: draft.end_seconds,
            status: ChapterStatus::Pending,
            storage: None,
            plain_size: None,
            encrypted_size: None,
            key_form: None,
            scheme: None,
            nonce_hex: None,
            finalized_at: None,
            error_code: None,
        }
    }
}

/// Admin-supplied chapter boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDraft {
    pub label: String,
    #[serde(rename = "startTime")]
    pub start_seconds: f64,
    #[serde(rename = "endTime", default)]
    pub end_seconds: Option<f64>,
}

/// Chapter counts per status, as reported by the status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChapterStatusSummary {
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
}

impl ChapterStatusSummary {
    pub fn of(chapters: &[Chapter]) -> Self {
        let mut summary = Self::default();
        for chapter in chapters {
            match chapter.status {
                ChapterStatus::Pending => summary.pending += 1,
                ChapterStatus::Ready => summary.ready += 1,
                ChapterStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Error, Debug)]
pub enum ChapterError {
    /// Two chapters claim overlapping time ranges.
    #[error("chapter '{first}' overlaps chapter '{second}'")]
    Overlaps { first: String, second: String },

    /// A chapter boundary falls outside the file duration.
    #[error("chapter '{label}' is out of range: [{start}, {end:?}) vs duration {duration}")]
    OutOfRange {
        label: String,
        start: f64,
        end: Option<f64>,
        duration: f64,
    },

    /// The requested chapter is not in `ready` state.
    #[error("chapter {0} is not ready for streaming")]
    NotReady(Uuid),

    /// Deleting a ready chapter requires an explicit reset.
    #[error("chapter {0} is finalized; reset it before deleting")]
    DeleteReady(Uuid),

    #[error("chapter {0} not found")]
    NotFound(Uuid),

    /// The target file has no content to cut chapters from.
    #[error("file {0} has no stored audio")]
    NoAudio(Uuid),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encrypt(#[from] SegmentEncryptError),

    #[error(transparent)]
    Decrypt(#[from] SegmentDecryptError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error during chapter finalization: {0}")]
    Io(#[from] std::io::Error),
}

/// The half-open time range a chapter covers, resolving open ends against
/// the following chapter and the file duration.
pub fn effective_end(chapters: &[Chapter], index: usize, duration: f64) -> f64 {
    match chapters[index].end_seconds {
        Some(end) => end,
        None => chapters
            .get(index + 1)
            .map_or(duration, |next| next.start_seconds),
    }
}

/// Map a chapter time range to a byte range of the original file.
///
/// The mapping is time-proportional: boundaries land at
/// `floor(t / duration * size)`. Because every boundary is computed the same
/// way, adjacent chapters meet exactly and a covering chapter set
/// concatenates to the original bytes.
pub fn byte_range(start: f64, end: f64, duration: f64, size: u64) -> (u64, u64) {
    debug_assert!(duration > 0.0);
    let clamp = |t: f64| -> u64 {
        let frac = (t / duration).clamp(0.0, 1.0);
        (frac * size as f64).floor() as u64
    };
    let from = clamp(start);
    let to = clamp(end).max(from);
    (from, to)
}

/// Validate a replacement pending set against the file duration and any
/// chapters that are already ready.
///
/// Rules: every boundary inside `[0, duration)`, ends after starts, and the
/// combined (ready + draft) set strictly ordered by start with no overlap.
pub fn validate_drafts(
    drafts: &[ChapterDraft],
    ready: &[Chapter],
    duration: f64,
) -> Result<(), ChapterError> {
    for draft in drafts {
        let in_range = draft.start_seconds >= 0.0 && draft.start_seconds < duration;
        let end_ok = match draft.end_seconds {
            None => true,
            Some(end) => end > draft.start_seconds && end <= duration,
        };
        if !in_range || !end_ok {
            return Err(ChapterError::OutOfRange {
                label: draft.label.clone(),
                start: draft.start_seconds,
                end: draft.end_seconds,
                duration,
            });
        }
    }

    // Merge ready ranges and drafts, then scan consecutive pairs.
    let mut ranges: Vec<(f64, Option<f64>, &str)> = ready
        .iter()
        .map(|c| (c.start_seconds, c.end_seconds, c.label.as_str()))
        .chain(
            drafts
                .iter()
                .map(|d| (d.start_seconds, d.end_seconds, d.label.as_str())),
        )
        .collect();
    ranges.sort_by(|a, b| a.0.total_cmp(&b.0));

    for pair in ranges.windows(2) {
        let (start_a, end_a, label_a) = pair[0];
        let (start_b, _, label_b) = pair[1];
        let overlapping = match end_a {
            Some(end) => end > start_b,
            // An open end closes at the next start; only an identical start
            // collides.
            None => (start_b - start_a).abs() < f64::EPSILON,
        };
        if overlapping || (start_b - start_a).abs() < f64::EPSILON {
            return Err(ChapterError::Overlaps {
                first: label_a.to_string(),
                second: label_b.to_string(),
            });
        }
    }

    Ok(())
}

/// Canonical demo boundaries, scaled to the file duration.
pub fn sample_drafts(duration: f64) -> Vec<ChapterDraft> {
    let third = duration / 3.0;
    vec![
        ChapterDraft {
            label: "Intro".to_string(),
            start_seconds: 0.0,
            end_seconds: Some(third),
        },
        ChapterDraft {
            label: "Body".to_string(),
            start_seconds: third,
            end_seconds: Some(third * 2.0),
        },
        ChapterDraft {
            label: "Outro".to_string(),
            start_seconds: third * 2.0,
            end_seconds: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(label: &str, start: f64, end: Option<f64>) -> ChapterDraft {
        ChapterDraft {
            label: label.to_string(),
            start_seconds: start,
            end_seconds: end,
        }
    }

    #[test]
    fn accepts_ordered_non_overlapping_set() {
        let drafts = vec![
            draft("Intro", 0.0, Some(30.0)),
            draft("Body", 30.0, Some(90.0)),
            draft("Outro", 90.0, None),
        ];
        assert!(validate_drafts(&drafts, &[], 120.0).is_ok());
    }

    #[test]
    fn rejects_overlap() {
        let drafts = vec![draft("A", 0.0, Some(40.0)), draft("B", 30.0, None)];
        assert!(matches!(
            validate_drafts(&drafts, &[], 120.0),
            Err(ChapterError::Overlaps { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_start() {
        let drafts = vec![draft("A", 130.0, None)];
        assert!(matches!(
            validate_drafts(&drafts, &[], 120.0),
            Err(ChapterError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_end_before_start() {
        let drafts = vec![draft("A", 50.0, Some(40.0))];
        assert!(matches!(
            validate_drafts(&drafts, &[], 120.0),
            Err(ChapterError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_conflict_with_ready_chapter() {
        let mut ready = Chapter::pending(Uuid::new_v4(), 0, &draft("Ready", 0.0, Some(60.0)));
        ready.status = ChapterStatus::Ready;
        let drafts = vec![draft("New", 30.0, None)];
        assert!(matches!(
            validate_drafts(&drafts, &[ready], 120.0),
            Err(ChapterError::Overlaps { .. })
        ));
    }

    #[test]
    fn byte_ranges_partition_the_file() {
        let duration = 90.0;
        let size = 1_000_001u64;
        let cuts = [(0.0, 30.0), (30.0, 60.0), (60.0, 90.0)];

        let mut covered = 0u64;
        let mut previous_end = 0u64;
        for (start, end) in cuts {
            let (from, to) = byte_range(start, end, duration, size);
            assert_eq!(from, previous_end);
            covered += to - from;
            previous_end = to;
        }
        assert_eq!(covered, size);
    }

    #[test]
    fn effective_end_uses_next_start_then_duration() {
        let file_id = Uuid::new_v4();
        let chapters = vec![
            Chapter::pending(file_id, 0, &draft("A", 0.0, None)),
            Chapter::pending(file_id, 1, &draft("B", 40.0, None)),
        ];
        assert_eq!(effective_end(&chapters, 0, 100.0), 40.0);
        assert_eq!(effective_end(&chapters, 1, 100.0), 100.0);
    }

    #[test]
    fn sample_covers_whole_duration() {
        let drafts = sample_drafts(120.0);
        assert_eq!(drafts.len(), 3);
        assert!(validate_drafts(&drafts, &[], 120.0).is_ok());
        assert_eq!(drafts[0].start_seconds, 0.0);
        assert!(drafts[2].end_seconds.is_none());
    }
}
