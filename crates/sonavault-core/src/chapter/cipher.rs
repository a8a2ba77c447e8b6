//! Chapter segment encryption.
//!
//! # Segment format
//!
//! An encrypted chapter segment is:
//!
//! - **Prelude (16 bytes)**: `magic "SVC1"` (4) || `version` (1) ||
//!   `scheme` (1) || `nonce_len` (1) || reserved (9, zero).
//! - **Segment nonce** (`nonce_len` bytes, 12 for the GCM-framed scheme),
//!   immediately after the prelude.
//! - **Framed blocks**: each block is `block_nonce` (12) || ciphertext
//!   (up to 64 KiB) || GCM tag (16).
//!
//! Each block is independently encrypted with AES-256-GCM using the block
//! index (u64 big-endian) concatenated with the segment nonce as additional
//! authenticated data. Blocks therefore cannot be reordered, duplicated, or
//! transplanted between segments without failing authentication, and any
//! block can be decrypted without touching the rest of the segment - which
//! is what makes range serving over ciphertext safe.

use std::fmt;
use std::path::PathBuf;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes opening every encrypted segment.
pub const MAGIC: [u8; 4] = *b"SVC1";

/// Current segment format version.
pub const FORMAT_VERSION: u8 = 1;

/// Fixed prelude length in bytes.
pub const PRELUDE_LEN: usize = 16;

/// Segment and block nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Offset of the first framed block (prelude + segment nonce).
pub const DATA_OFFSET: usize = PRELUDE_LEN + NONCE_LEN;

/// Maximum plaintext bytes per framed block (64 KiB).
pub const BLOCK_PLAINTEXT_SIZE: usize = 64 * 1024;

/// Per-block overhead (nonce + tag).
pub const BLOCK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Maximum encrypted block size.
pub const BLOCK_ENCRYPTED_SIZE: usize = BLOCK_PLAINTEXT_SIZE + BLOCK_OVERHEAD;

/// Encryption scheme identifiers carried in the prelude.
///
/// Only the framed-GCM scheme is implemented; the byte exists so a
/// CTR+HMAC scheme can be added without a format break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentScheme {
    /// AES-256-GCM in independently framed 64 KiB blocks.
    GcmFramed = 1,
}

impl SegmentScheme {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SegmentScheme::GcmFramed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentScheme::GcmFramed => "gcm-framed-v1",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Context for segment operations, carried in error messages.
#[derive(Debug, Clone, Default)]
pub struct SegmentContext {
    /// The owning chapter (if known).
    pub chapter_id: Option<Uuid>,
    /// The ciphertext location on disk.
    pub path: Option<PathBuf>,
    /// The framed block number (for block-level errors).
    pub block: Option<u64>,
}

impl SegmentContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_chapter(mut self, chapter_id: Uuid) -> Self {
        self.chapter_id = Some(chapter_id);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }
}

impl fmt::Display for SegmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(chapter_id) = self.chapter_id {
            parts.push(format!("chapter {chapter_id}"));
        }
        if let Some(block) = self.block {
            parts.push(format!("block {block}"));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum SegmentDecryptError {
    /// The prelude is malformed (bad magic, version, scheme, or length).
    #[error("invalid segment header for {context}: {reason}")]
    InvalidHeader {
        reason: String,
        context: SegmentContext,
    },

    /// A framed block failed its authentication tag check.
    #[error("block decryption failed for {context}: authentication tag mismatch")]
    BlockAuthFailed { context: SegmentContext },

    /// A framed block is too short to carry a nonce and tag.
    #[error("incomplete block for {context}: expected at least {expected} bytes, got {actual}")]
    IncompleteBlock {
        expected: usize,
        actual: usize,
        context: SegmentContext,
    },

    /// IO error while reading ciphertext.
    #[error("IO error reading {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: SegmentContext,
    },
}

impl SegmentDecryptError {
    #[must_use]
    pub fn io_with_context(source: std::io::Error, context: SegmentContext) -> Self {
        SegmentDecryptError::Io { source, context }
    }
}

#[derive(Error, Debug)]
pub enum SegmentEncryptError {
    /// Block encryption failed unexpectedly.
    #[error("block encryption failed for {context}: {reason}")]
    BlockEncryption {
        reason: String,
        context: SegmentContext,
    },

    /// IO error while writing ciphertext.
    #[error("IO error writing {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: SegmentContext,
    },
}

// ============================================================================
// Block math
// ============================================================================

/// The framed block containing the given plaintext offset.
#[inline]
pub fn plaintext_to_block(offset: u64) -> u64 {
    offset / BLOCK_PLAINTEXT_SIZE as u64
}

/// Offset within its block of the given plaintext offset.
#[inline]
pub fn plaintext_offset_in_block(offset: u64) -> usize {
    (offset % BLOCK_PLAINTEXT_SIZE as u64) as usize
}

/// Byte offset of a framed block within the encrypted segment.
#[inline]
pub fn block_to_encrypted_offset(block: u64) -> u64 {
    DATA_OFFSET as u64 + block * BLOCK_ENCRYPTED_SIZE as u64
}

/// Encrypted segment size for a given plaintext size.
pub fn plaintext_to_encrypted_size(plain: u64) -> u64 {
    let blocks = if plain == 0 {
        1 // empty segments still carry one authenticated empty block
    } else {
        plain.div_ceil(BLOCK_PLAINTEXT_SIZE as u64)
    };
    DATA_OFFSET as u64 + plain + blocks * BLOCK_OVERHEAD as u64
}

/// Plaintext size recovered from an encrypted segment size.
///
/// Returns `None` when the size cannot correspond to a well-formed segment.
pub fn encrypted_to_plaintext_size(encrypted: u64) -> Option<u64> {
    let content = encrypted.checked_sub(DATA_OFFSET as u64)?;
    if content == 0 {
        return None;
    }

    let full_blocks = content / BLOCK_ENCRYPTED_SIZE as u64;
    let remainder = content % BLOCK_ENCRYPTED_SIZE as u64;

    let mut plain = full_blocks * BLOCK_PLAINTEXT_SIZE as u64;
    if remainder > 0 {
        if remainder < BLOCK_OVERHEAD as u64 {
            return None;
        }
        plain += remainder - BLOCK_OVERHEAD as u64;
    }
    Some(plain)
}

// ============================================================================
// Prelude encode / decode
// ============================================================================

/// Decoded segment prelude.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub scheme: SegmentScheme,
    pub nonce: [u8; NONCE_LEN],
}

/// Encode the prelude and segment nonce.
pub fn encode_header(scheme: SegmentScheme, nonce: &[u8; NONCE_LEN]) -> [u8; DATA_OFFSET] {
    let mut out = [0u8; DATA_OFFSET];
    out[..4].copy_from_slice(&MAGIC);
    out[4] = FORMAT_VERSION;
    out[5] = scheme as u8;
    out[6] = NONCE_LEN as u8;
    // bytes 7..16 reserved, zero
    out[PRELUDE_LEN..].copy_from_slice(nonce);
    out
}

/// Decode and validate a segment prelude.
pub fn decode_header(
    bytes: &[u8],
    context: &SegmentContext,
) -> Result<SegmentHeader, SegmentDecryptError> {
    if bytes.len() < DATA_OFFSET {
        return Err(SegmentDecryptError::InvalidHeader {
            reason: format!(
                "segment too small: expected at least {DATA_OFFSET} bytes, got {}",
                bytes.len()
            ),
            context: context.clone(),
        });
    }
    if bytes[..4] != MAGIC {
        return Err(SegmentDecryptError::InvalidHeader {
            reason: "bad magic bytes".to_string(),
            context: context.clone(),
        });
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(SegmentDecryptError::InvalidHeader {
            reason: format!("unsupported format version {}", bytes[4]),
            context: context.clone(),
        });
    }
    let scheme =
        SegmentScheme::from_byte(bytes[5]).ok_or_else(|| SegmentDecryptError::InvalidHeader {
            reason: format!("unknown scheme {}", bytes[5]),
            context: context.clone(),
        })?;
    if bytes[6] as usize != NONCE_LEN {
        return Err(SegmentDecryptError::InvalidHeader {
            reason: format!("unsupported nonce length {}", bytes[6]),
            context: context.clone(),
        });
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[PRELUDE_LEN..DATA_OFFSET]);
    Ok(SegmentHeader {
        scheme,
        nonce,
    })
}

// ============================================================================
// Whole-segment encrypt / decrypt
// ============================================================================

/// Build the AAD for a framed block: block index (u64 BE) || segment nonce.
#[inline]
fn block_aad(block: u64, segment_nonce: &[u8; NONCE_LEN]) -> [u8; 8 + NONCE_LEN] {
    let mut aad = [0u8; 8 + NONCE_LEN];
    aad[..8].copy_from_slice(&block.to_be_bytes());
    aad[8..].copy_from_slice(segment_nonce);
    aad
}

/// Encrypt a chapter plaintext into a complete segment blob.
#[instrument(level = "debug", skip_all, fields(plain_size = plaintext.len()))]
pub fn encrypt_segment(
    plaintext: &[u8],
    data_key: &[u8; 32],
    base_context: &SegmentContext,
) -> Result<Vec<u8>, SegmentEncryptError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key));

    let mut segment_nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut segment_nonce);

    let mut out =
        Vec::with_capacity(plaintext_to_encrypted_size(plaintext.len() as u64) as usize);
    out.extend_from_slice(&encode_header(SegmentScheme::GcmFramed, &segment_nonce));

    // An empty chapter still carries one authenticated empty block so that
    // truncation to nothing is detectable.
    let blocks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![&[]]
    } else {
        plaintext.chunks(BLOCK_PLAINTEXT_SIZE).collect()
    };

    for (block_number, block) in blocks.iter().enumerate() {
        let mut block_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut block_nonce);

        let aad = block_aad(block_number as u64, &segment_nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&block_nonce),
                Payload {
                    msg: block,
                    aad: &aad,
                },
            )
            .map_err(|e| SegmentEncryptError::BlockEncryption {
                reason: e.to_string(),
                context: base_context.clone().with_block(block_number as u64),
            })?;

        out.extend_from_slice(&block_nonce);
        out.extend_from_slice(&ciphertext);
    }

    debug!(encrypted_size = out.len(), "Segment encrypted");
    Ok(out)
}

/// Decrypt one framed block given the segment header.
pub fn decrypt_block(
    cipher: &Aes256Gcm,
    header: &SegmentHeader,
    block_number: u64,
    framed: &[u8],
    base_context: &SegmentContext,
) -> Result<Vec<u8>, SegmentDecryptError> {
    let context = base_context.clone().with_block(block_number);

    if framed.len() < BLOCK_OVERHEAD {
        return Err(SegmentDecryptError::IncompleteBlock {
            expected: BLOCK_OVERHEAD,
            actual: framed.len(),
            context,
        });
    }

    let nonce = Nonce::from_slice(&framed[..NONCE_LEN]);
    let aad = block_aad(block_number, &header.nonce);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &framed[NONCE_LEN..],
                aad: &aad,
            },
        )
        .map_err(|_| {
            warn!(block = block_number, "Block decryption failed - authentication tag mismatch");
            SegmentDecryptError::BlockAuthFailed { context }
        })
}

/// Decrypt a complete segment blob back to its plaintext.
#[instrument(level = "debug", skip_all, fields(encrypted_size = blob.len()))]
pub fn decrypt_segment(
    blob: &[u8],
    data_key: &[u8; 32],
    base_context: &SegmentContext,
) -> Result<Vec<u8>, SegmentDecryptError> {
    let header = decode_header(blob, base_context)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(data_key));

    let content = &blob[DATA_OFFSET..];
    let mut plaintext = Vec::new();
    for (block_number, framed) in content.chunks(BLOCK_ENCRYPTED_SIZE).enumerate() {
        trace!(block = block_number, framed_len = framed.len(), "Decrypting block");
        let block = decrypt_block(&cipher, &header, block_number as u64, framed, base_context)?;
        plaintext.extend_from_slice(&block);
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn roundtrip_empty() {
        let key = test_key();
        let blob = encrypt_segment(&[], &key, &SegmentContext::new()).unwrap();
        assert_eq!(blob.len(), DATA_OFFSET + BLOCK_OVERHEAD);
        let plain = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn roundtrip_multi_block() {
        let key = test_key();
        let mut content = vec![0u8; BLOCK_PLAINTEXT_SIZE * 2 + 1234];
        rand::rng().fill_bytes(&mut content);

        let blob = encrypt_segment(&content, &key, &SegmentContext::new()).unwrap();
        assert_eq!(blob.len() as u64, plaintext_to_encrypted_size(content.len() as u64));

        let plain = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap();
        assert_eq!(plain, content);
    }

    #[test]
    fn roundtrip_exact_block_boundary() {
        let key = test_key();
        let content = vec![0xA5u8; BLOCK_PLAINTEXT_SIZE];
        let blob = encrypt_segment(&content, &key, &SegmentContext::new()).unwrap();
        let plain = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap();
        assert_eq!(plain, content);
    }

    #[test]
    fn tampered_block_fails_auth() {
        let key = test_key();
        let content = vec![1u8; 100_000];
        let mut blob = encrypt_segment(&content, &key, &SegmentContext::new()).unwrap();

        // Flip one ciphertext bit in the second block.
        let victim = DATA_OFFSET + BLOCK_ENCRYPTED_SIZE + NONCE_LEN + 10;
        blob[victim] ^= 0x01;

        let err = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap_err();
        assert!(matches!(err, SegmentDecryptError::BlockAuthFailed { .. }));
    }

    #[test]
    fn swapped_blocks_fail_auth() {
        let key = test_key();
        let content = vec![2u8; BLOCK_PLAINTEXT_SIZE * 2];
        let mut blob = encrypt_segment(&content, &key, &SegmentContext::new()).unwrap();

        // Swapping two full framed blocks must break the index-bound AAD.
        let (a, b) = (DATA_OFFSET, DATA_OFFSET + BLOCK_ENCRYPTED_SIZE);
        let first: Vec<u8> = blob[a..a + BLOCK_ENCRYPTED_SIZE].to_vec();
        let second: Vec<u8> = blob[b..b + BLOCK_ENCRYPTED_SIZE].to_vec();
        blob[a..a + BLOCK_ENCRYPTED_SIZE].copy_from_slice(&second);
        blob[b..b + BLOCK_ENCRYPTED_SIZE].copy_from_slice(&first);

        assert!(decrypt_segment(&blob, &key, &SegmentContext::new()).is_err());
    }

    #[test]
    fn wrong_key_fails_auth() {
        let blob = encrypt_segment(b"secret audio", &test_key(), &SegmentContext::new()).unwrap();
        assert!(decrypt_segment(&blob, &test_key(), &SegmentContext::new()).is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let key = test_key();
        let mut blob = encrypt_segment(b"x", &key, &SegmentContext::new()).unwrap();
        blob[0] = b'X';
        let err = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap_err();
        assert!(matches!(err, SegmentDecryptError::InvalidHeader { .. }));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let key = test_key();
        let mut blob = encrypt_segment(b"x", &key, &SegmentContext::new()).unwrap();
        blob[5] = 9;
        let err = decrypt_segment(&blob, &key, &SegmentContext::new()).unwrap_err();
        assert!(matches!(err, SegmentDecryptError::InvalidHeader { ref reason, .. } if reason.contains("scheme")));
    }

    proptest! {
        #[test]
        fn size_math_roundtrips(plain in 0u64..4_000_000) {
            let encrypted = plaintext_to_encrypted_size(plain);
            if plain == 0 {
                // Empty segments are a special case: one empty block.
                prop_assert_eq!(encrypted, (DATA_OFFSET + BLOCK_OVERHEAD) as u64);
            } else {
                prop_assert_eq!(encrypted_to_plaintext_size(encrypted), Some(plain));
            }
        }

        #[test]
        fn block_math_is_consistent(offset in 0u64..10_000_000) {
            let block = plaintext_to_block(offset);
            let within = plaintext_offset_in_block(offset) as u64;
            prop_assert_eq!(block * BLOCK_PLAINTEXT_SIZE as u64 + within, offset);
            prop_assert!(within < BLOCK_PLAINTEXT_SIZE as u64);
        }
    }
}
