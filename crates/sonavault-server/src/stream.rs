//! Decrypt-on-the-fly range streaming.
//!
//! The response body is produced lazily in bounded steps (64 KiB): each
//! step decrypts at most one framed block's worth of data, so a chapter is
//! never buffered whole. The first step runs before headers are committed,
//! which turns an immediately-broken ciphertext into a proper 5xx instead
//! of a truncated 200. Later failures terminate the connection and mark
//! the chapter failed for operator attention.
//!
//! Dropping the body (client disconnect) drops the segment readers, whose
//! key material is zeroized on drop.

use std::io::SeekFrom;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use sonavault_core::chapter::{ChapterError, SegmentDecryptError, SegmentReader};
use sonavault_core::stream::{ByteSource, ChapterSpan};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Bytes produced per body step.
const STREAM_STEP: usize = 64 * 1024;

/// A cursor walking a resolved byte source.
struct SourceCursor {
    state: AppState,
    source: ByteSource,
    /// Absolute position in the source's plaintext.
    pos: u64,
    remaining: u64,
    /// Open reader and the index of the span it belongs to.
    reader: Option<(usize, SegmentReader)>,
    file: Option<tokio::fs::File>,
}

impl SourceCursor {
    fn new(state: AppState, source: ByteSource, offset: u64, len: u64) -> Self {
        Self {
            state,
            source,
            pos: offset,
            remaining: len,
            reader: None,
            file: None,
        }
    }

    /// Produce the next body chunk, or `None` when the slice is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ApiError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = (self.remaining as usize).min(STREAM_STEP);

        let chunk = match &self.source {
            ByteSource::Original { path, len } => {
                let len = *len;
                if self.file.is_none() {
                    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
                        error!(error = %e, "Failed to open original for streaming");
                        ApiError::IoFailed
                    })?;
                    file.seek(SeekFrom::Start(self.pos))
                        .await
                        .map_err(|_| ApiError::IoFailed)?;
                    self.file = Some(file);
                }
                let want = want.min((len - self.pos) as usize);
                let mut buf = vec![0u8; want];
                self.file
                    .as_mut()
                    .expect("file opened above")
                    .read_exact(&mut buf)
                    .await
                    .map_err(|_| ApiError::IoFailed)?;
                buf
            }
            ByteSource::SingleChapter { span } => {
                let span = span.clone();
                self.read_span_chunk(0, &span, want).await?
            }
            ByteSource::Chaptered { spans, .. } => {
                // Locate the span containing the current position.
                let index = match spans
                    .binary_search_by(|s| s.offset.cmp(&self.pos))
                {
                    Ok(index) => index,
                    Err(insert) => insert.saturating_sub(1),
                };
                let span = spans[index].clone();
                self.read_span_chunk(index, &span, want).await?
            }
        };

        if chunk.is_empty() {
            // A source that runs dry before the promised length is a
            // server-side defect; terminate rather than pad.
            warn!(pos = self.pos, remaining = self.remaining, "Stream source ran dry");
            return Err(ApiError::IoFailed);
        }

        self.pos += chunk.len() as u64;
        self.remaining -= chunk.len() as u64;
        Ok(Some(Bytes::from(chunk)))
    }

    /// Read up to `want` bytes from one chapter span at the cursor position.
    async fn read_span_chunk(
        &mut self,
        index: usize,
        span: &ChapterSpan,
        want: usize,
    ) -> Result<Vec<u8>, ApiError> {
        let local = self.pos - span.offset;
        let left_in_span = (span.len - local) as usize;
        let want = want.min(left_in_span);

        if self.reader.as_ref().is_none_or(|(open, _)| *open != index) {
            let reader = self
                .state
                .chapters
                .open_reader(&span.chapter)
                .await
                .map_err(|e| self.decrypt_failure(span.chapter.id, e))?;
            self.reader = Some((index, reader));
        }

        let (_, reader) = self.reader.as_mut().expect("reader opened above");
        match reader.read_range(local, want).await {
            Ok(bytes) => Ok(bytes),
            Err(err) => Err(self.segment_failure(span.chapter.id, err)),
        }
    }

    fn decrypt_failure(&self, chapter_id: Uuid, err: ChapterError) -> ApiError {
        error!(%chapter_id, error = %err, "Failed to open chapter for streaming");
        // Transient IO trouble is not evidence of tampering; only crypto
        // failures poison the chapter row.
        if matches!(err, ChapterError::Decrypt(_) | ChapterError::Crypto(_)) {
            mark_failed_in_background(&self.state, chapter_id);
        }
        err.into()
    }

    fn segment_failure(&self, chapter_id: Uuid, err: SegmentDecryptError) -> ApiError {
        error!(%chapter_id, error = %err, "Chapter decryption failed during streaming");
        if matches!(err, SegmentDecryptError::BlockAuthFailed { .. }) {
            mark_failed_in_background(&self.state, chapter_id);
        }
        err.into()
    }
}

/// Record a decryption failure without blocking the response path.
fn mark_failed_in_background(state: &AppState, chapter_id: Uuid) {
    let chapters = state.chapters.clone();
    tokio::spawn(async move {
        if let Err(e) = chapters.mark_failed(chapter_id, "DECRYPT_FAILED").await {
            warn!(%chapter_id, error = %e, "Could not mark chapter failed");
        }
    });
}

/// Build the streaming response for a slice of a byte source.
///
/// `window` restricts the addressable resource (signed-URL time shifting);
/// the `Range` header is interpreted relative to it. `status_partial`
/// decides between 200 and 206.
pub async fn stream_slice(
    state: AppState,
    source: ByteSource,
    window_offset: u64,
    window_len: u64,
    range: Option<(u64, u64)>,
    mime: &str,
) -> ApiResult<Response> {
    let (status, slice_start, slice_len, content_range) = match range {
        None => (StatusCode::OK, 0, window_len, None),
        Some((start, end)) => {
            let len = end - start + 1;
            (
                StatusCode::PARTIAL_CONTENT,
                start,
                len,
                Some(format!("bytes {start}-{end}/{window_len}")),
            )
        }
    };

    let mut cursor = SourceCursor::new(
        state,
        source,
        window_offset + slice_start,
        slice_len,
    );

    // Pull the first chunk before committing headers so an unreadable
    // ciphertext surfaces as 5xx DECRYPT_FAILED, not a dead 200.
    let first = cursor.next_chunk().await?;
    debug!(status = %status, len = slice_len, "Starting stream");

    let body_stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<Bytes, std::io::Error>> + Send>,
    > = Box::pin(async_stream::try_stream! {
        if let Some(first) = first {
            yield first;
        }
        loop {
            // Headers are out by now; a failure here cuts the connection.
            let chunk = cursor
                .next_chunk()
                .await
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            match chunk {
                Some(chunk) => yield chunk,
                None => break,
            }
        }
    });
    let body = Body::from_stream(body_stream);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, slice_len)
        .header(header::CACHE_CONTROL, "no-store, private")
        .header(header::CONTENT_DISPOSITION, "inline")
        .header(
            header::CONTENT_SECURITY_POLICY,
            "default-src 'none'; media-src 'self'",
        )
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder.body(body).map_err(|_| ApiError::Internal)
}
