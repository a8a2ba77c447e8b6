//! Random-access reads over encrypted chapter segments.
//!
//! [`SegmentReader`] decrypts only the framed blocks a byte range touches,
//! which keeps `Range` requests cheap regardless of chapter size. A one-block
//! cache covers the common sequential streaming pattern where consecutive
//! reads land in the same block.

use std::io::SeekFrom;
use std::path::Path;

use aes_gcm::{Aes256Gcm, Key, aead::KeyInit};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, trace};
use zeroize::Zeroizing;

use super::cipher::{
    BLOCK_ENCRYPTED_SIZE, BLOCK_OVERHEAD, DATA_OFFSET, SegmentContext, SegmentDecryptError,
    SegmentHeader, block_to_encrypted_offset, decode_header, decrypt_block,
    encrypted_to_plaintext_size, plaintext_offset_in_block, plaintext_to_block,
};

/// Where a segment's ciphertext lives.
enum SegmentBytes {
    /// Filesystem-backed segment (`CHAPTER_STORAGE_ROOT/{file}/{chapter}.enc`).
    File(File),
    /// Inline segment loaded from the entity store.
    Memory(Vec<u8>),
}

/// Streaming decryptor for one encrypted chapter segment.
pub struct SegmentReader {
    bytes: SegmentBytes,
    cipher: Aes256Gcm,
    header: SegmentHeader,
    plaintext_size: u64,
    context: SegmentContext,
    /// Most recently decrypted block: (block number, plaintext).
    cached_block: Option<(u64, Zeroizing<Vec<u8>>)>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("plaintext_size", &self.plaintext_size)
            .field("cached_block", &self.cached_block.as_ref().map(|(n, _)| n))
            .finish_non_exhaustive()
    }
}

impl SegmentReader {
    /// Open a filesystem-backed segment for streaming reads.
    #[instrument(level = "debug", skip(data_key), fields(path = %path.as_ref().display()))]
    pub async fn open(
        path: impl AsRef<Path>,
        data_key: &[u8; 32],
        context: SegmentContext,
    ) -> Result<Self, SegmentDecryptError> {
        let path = path.as_ref();
        let context = context.with_path(path);

        let mut file = File::open(path)
            .await
            .map_err(|e| SegmentDecryptError::io_with_context(e, context.clone()))?;
        let encrypted_size = file
            .metadata()
            .await
            .map_err(|e| SegmentDecryptError::io_with_context(e, context.clone()))?
            .len();

        let mut prelude = [0u8; DATA_OFFSET];
        file.read_exact(&mut prelude)
            .await
            .map_err(|e| SegmentDecryptError::io_with_context(e, context.clone()))?;
        let header = decode_header(&prelude, &context)?;

        let plaintext_size = Self::plaintext_size_for(encrypted_size, &context)?;
        debug!(encrypted_size, plaintext_size, "Segment opened for streaming read");

        Ok(Self {
            bytes: SegmentBytes::File(file),
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key)),
            header,
            plaintext_size,
            context,
            cached_block: None,
        })
    }

    /// Wrap an inline segment blob for streaming reads.
    pub fn from_blob(
        blob: Vec<u8>,
        data_key: &[u8; 32],
        context: SegmentContext,
    ) -> Result<Self, SegmentDecryptError> {
        let header = decode_header(&blob, &context)?;
        let plaintext_size = Self::plaintext_size_for(blob.len() as u64, &context)?;

        Ok(Self {
            bytes: SegmentBytes::Memory(blob),
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key)),
            header,
            plaintext_size,
            context,
            cached_block: None,
        })
    }

    fn plaintext_size_for(
        encrypted_size: u64,
        context: &SegmentContext,
    ) -> Result<u64, SegmentDecryptError> {
        // A segment of exactly one empty block is a valid empty chapter.
        if encrypted_size == (DATA_OFFSET + BLOCK_OVERHEAD) as u64 {
            return Ok(0);
        }
        encrypted_to_plaintext_size(encrypted_size).ok_or_else(|| {
            SegmentDecryptError::InvalidHeader {
                reason: format!("implausible segment size {encrypted_size}"),
                context: context.clone(),
            }
        })
    }

    /// Total plaintext size of the segment.
    #[inline]
    pub fn plaintext_size(&self) -> u64 {
        self.plaintext_size
    }

    /// Read a plaintext byte range, decrypting only the blocks it touches.
    ///
    /// Returns fewer bytes than requested when the range crosses EOF.
    pub async fn read_range(
        &mut self,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, SegmentDecryptError> {
        if offset >= self.plaintext_size {
            trace!(offset, size = self.plaintext_size, "Read past EOF");
            return Ok(Vec::new());
        }

        let available = (self.plaintext_size - offset) as usize;
        let actual_len = len.min(available);
        if actual_len == 0 {
            return Ok(Vec::new());
        }

        let start_block = plaintext_to_block(offset);
        let end_block = plaintext_to_block(offset + actual_len as u64 - 1);

        let mut result = Vec::with_capacity(actual_len);
        for block_number in start_block..=end_block {
            let block = self.read_block(block_number).await?;

            let from = if block_number == start_block {
                plaintext_offset_in_block(offset)
            } else {
                0
            };
            let remaining = actual_len - result.len();
            let to = (from + remaining).min(block.len());

            if from < block.len() {
                result.extend_from_slice(&block[from..to]);
            }
            if result.len() >= actual_len {
                break;
            }
        }

        result.truncate(actual_len);
        Ok(result)
    }

    /// Read and decrypt a single framed block, consulting the cache first.
    async fn read_block(
        &mut self,
        block_number: u64,
    ) -> Result<Zeroizing<Vec<u8>>, SegmentDecryptError> {
        if let Some((cached, ref data)) = self.cached_block {
            if cached == block_number {
                trace!(block = block_number, "Block cache hit");
                return Ok(data.clone());
            }
        }

        let framed = self.read_framed(block_number).await?;
        let plain = Zeroizing::new(decrypt_block(
            &self.cipher,
            &self.header,
            block_number,
            &framed,
            &self.context,
        )?);
        self.cached_block = Some((block_number, plain.clone()));
        Ok(plain)
    }

    /// Fetch the raw framed bytes for a block from the backing storage.
    async fn read_framed(&mut self, block_number: u64) -> Result<Vec<u8>, SegmentDecryptError> {
        let start = block_to_encrypted_offset(block_number);
        let context = self.context.clone().with_block(block_number);

        match &mut self.bytes {
            SegmentBytes::File(file) => {
                file.seek(SeekFrom::Start(start))
                    .await
                    .map_err(|e| SegmentDecryptError::io_with_context(e, context.clone()))?;

                let mut framed = vec![0u8; BLOCK_ENCRYPTED_SIZE];
                let mut filled = 0;
                while filled < framed.len() {
                    let n = file
                        .read(&mut framed[filled..])
                        .await
                        .map_err(|e| SegmentDecryptError::io_with_context(e, context.clone()))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                framed.truncate(filled);

                if framed.len() < BLOCK_OVERHEAD {
                    return Err(SegmentDecryptError::IncompleteBlock {
                        expected: BLOCK_OVERHEAD,
                        actual: framed.len(),
                        context,
                    });
                }
                Ok(framed)
            }
            SegmentBytes::Memory(blob) => {
                let start = start as usize;
                if start >= blob.len() {
                    return Err(SegmentDecryptError::IncompleteBlock {
                        expected: BLOCK_OVERHEAD,
                        actual: 0,
                        context,
                    });
                }
                let end = (start + BLOCK_ENCRYPTED_SIZE).min(blob.len());
                if end - start < BLOCK_OVERHEAD {
                    return Err(SegmentDecryptError::IncompleteBlock {
                        expected: BLOCK_OVERHEAD,
                        actual: end - start,
                        context,
                    });
                }
                Ok(blob[start..end].to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::cipher::{BLOCK_PLAINTEXT_SIZE, encrypt_segment};
    use rand::RngCore;

    fn sealed(content: &[u8]) -> (Vec<u8>, [u8; 32]) {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        let blob = encrypt_segment(content, &key, &SegmentContext::new()).unwrap();
        (blob, key)
    }

    #[tokio::test]
    async fn reads_exact_ranges_from_blob() {
        let mut content = vec![0u8; BLOCK_PLAINTEXT_SIZE * 3 + 500];
        rand::rng().fill_bytes(&mut content);
        let (blob, key) = sealed(&content);

        let mut reader = SegmentReader::from_blob(blob, &key, SegmentContext::new()).unwrap();
        assert_eq!(reader.plaintext_size(), content.len() as u64);

        // Within one block.
        let got = reader.read_range(100, 50).await.unwrap();
        assert_eq!(got, &content[100..150]);

        // Crossing a block boundary.
        let start = BLOCK_PLAINTEXT_SIZE as u64 - 10;
        let got = reader.read_range(start, 20).await.unwrap();
        assert_eq!(got, &content[start as usize..start as usize + 20]);

        // Tail read clamps at EOF.
        let got = reader.read_range(content.len() as u64 - 5, 100).await.unwrap();
        assert_eq!(got, &content[content.len() - 5..]);

        // Past EOF reads empty.
        assert!(reader.read_range(content.len() as u64, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_from_file_backing() {
        let mut content = vec![0u8; BLOCK_PLAINTEXT_SIZE + 77];
        rand::rng().fill_bytes(&mut content);
        let (blob, key) = sealed(&content);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.enc");
        tokio::fs::write(&path, &blob).await.unwrap();

        let mut reader = SegmentReader::open(&path, &key, SegmentContext::new())
            .await
            .unwrap();
        let got = reader.read_range(0, content.len()).await.unwrap();
        assert_eq!(got, content);
    }

    #[tokio::test]
    async fn tampered_file_fails_on_touched_block_only() {
        let content = vec![3u8; BLOCK_PLAINTEXT_SIZE * 2];
        let (mut blob, key) = sealed(&content);

        // Corrupt the second block; the first must stay readable.
        let victim = DATA_OFFSET + BLOCK_ENCRYPTED_SIZE + 40;
        blob[victim] ^= 0xFF;

        let mut reader = SegmentReader::from_blob(blob, &key, SegmentContext::new()).unwrap();
        assert!(reader.read_range(0, 1024).await.is_ok());

        let err = reader
            .read_range(BLOCK_PLAINTEXT_SIZE as u64, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentDecryptError::BlockAuthFailed { .. }));
    }

    #[tokio::test]
    async fn empty_segment_has_zero_size() {
        let (blob, key) = sealed(&[]);
        let mut reader = SegmentReader::from_blob(blob, &key, SegmentContext::new()).unwrap();
        assert_eq!(reader.plaintext_size(), 0);
        assert!(reader.read_range(0, 10).await.unwrap().is_empty());
    }
}
