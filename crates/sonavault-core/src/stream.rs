//! Playback byte-source resolution.
//!
//! Every stream request resolves to one of three byte sources: the original
//! file (only while the file has no ready chapters), the virtual
//! concatenation of ready chapter plaintexts, or a single chapter. A
//! chapterized file is never served from its original bytes.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::chapter::{Chapter, ChapterError, ChapterStatus};
use crate::library::AudioFile;
use crate::store::{Store, StoreError};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("chapter {0} is not ready for streaming")]
    ChapterNotReady(Uuid),

    #[error(transparent)]
    Chapter(#[from] ChapterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One ready chapter's place in the virtual plaintext.
#[derive(Debug, Clone)]
pub struct ChapterSpan {
    pub chapter: Chapter,
    /// Offset of this chapter's first byte in the virtual stream.
    pub offset: u64,
    pub len: u64,
}

/// A resolved byte source for a stream request.
#[derive(Debug)]
pub enum ByteSource {
    /// The stored original (file has no ready chapters).
    Original { path: PathBuf, len: u64 },
    /// Ready chapters concatenated in ordinal order.
    Chaptered { spans: Vec<ChapterSpan>, total: u64 },
    /// One ready chapter.
    SingleChapter { span: ChapterSpan },
}

impl ByteSource {
    /// Total plaintext length of the source.
    pub fn len(&self) -> u64 {
        match self {
            ByteSource::Original { len, .. } => *len,
            ByteSource::Chaptered { total, .. } => *total,
            ByteSource::SingleChapter { span } => span.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the span table for a file's ready chapters, with cached cumulative
/// offsets.
fn spans_for(chapters: Vec<Chapter>) -> Vec<ChapterSpan> {
    let mut spans = Vec::new();
    let mut offset = 0u64;
    for chapter in chapters
        .into_iter()
        .filter(|c| c.status == ChapterStatus::Ready)
    {
        let len = chapter.plain_size.unwrap_or(0);
        if len == 0 {
            continue; // zero-length chapters add nothing addressable
        }
        spans.push(ChapterSpan {
            chapter,
            offset,
            len,
        });
        offset += len;
    }
    spans
}

/// Resolve the byte source for full-file streaming (DRM session and signed
/// URL redemptions).
pub async fn resolve_file_source(
    store: &Arc<dyn Store>,
    file: &AudioFile,
) -> Result<ByteSource, StreamError> {
    let chapters = store.chapters_for_file(file.id).await?;
    let spans = spans_for(chapters);

    if spans.is_empty() {
        return Ok(ByteSource::Original {
            path: file.storage_path.clone(),
            len: file.size,
        });
    }

    let total = spans.iter().map(|s| s.len).sum();
    Ok(ByteSource::Chaptered { spans, total })
}

/// Resolve the byte source for a single-chapter stream.
pub async fn resolve_chapter_source(
    store: &Arc<dyn Store>,
    chapter_id: Uuid,
) -> Result<ByteSource, StreamError> {
    let chapter = store.chapter_by_id(chapter_id).await?;
    if chapter.status != ChapterStatus::Ready {
        return Err(StreamError::ChapterNotReady(chapter_id));
    }
    let len = chapter.plain_size.unwrap_or(0);
    Ok(ByteSource::SingleChapter {
        span: ChapterSpan {
            chapter,
            offset: 0,
            len,
        },
    })
}

/// Map a playback time to a byte offset of the source, using the same
/// proportional mapping the chapter cutter uses.
pub fn time_to_offset(duration_seconds: f64, total_len: u64, seconds: f64) -> u64 {
    if duration_seconds <= 0.0 {
        return 0;
    }
    let frac = (seconds / duration_seconds).clamp(0.0, 1.0);
    (frac * total_len as f64).floor() as u64
}
