//! Root key and signing key handling.
//!
//! The root key never leaves the process in plaintext and is only exposed to
//! callers through scoped access; `Debug` output is redacted. The token
//! signing key lives in a [`SigningKeyCell`] that supports admin-demand
//! rotation behind a read-mostly lock.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::CryptoError;

/// Length of a wrapped data key blob: 12-byte nonce + 32-byte ciphertext +
/// 16-byte GCM tag.
pub const WRAPPED_KEY_LEN: usize = 12 + 32 + 16;

/// HKDF info label for chapter data keys. Changing this value is a format
/// break: existing derived-key chapters become undecryptable.
const CHAPTER_KEY_INFO: &[u8] = b"chapter-v1";

/// Process-wide root key (32 bytes) for the chapter key hierarchy.
///
/// # Security
///
/// The key bytes are held in a `Zeroizing` buffer and erased on drop. The
/// `Debug` implementation redacts the material. Callers never receive the
/// raw array except inside the scoped [`RootKey::with_key`] closure.
pub struct RootKey {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl RootKey {
    /// Construct a root key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Parse a root key from its hex configuration form (64 hex chars).
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        if raw.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: raw.len(),
            });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self::from_bytes(bytes))
    }

    /// Generate a random root key. Used by tests and the demo configuration
    /// path; production deployments load the key from `ROOT_KEY`.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Run a closure with scoped access to the raw key bytes.
    pub fn with_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(&self.key)
    }

    /// Derive the data key for a chapter via HKDF-SHA256.
    ///
    /// Salt is `chapter_id || file_id` (raw UUID bytes), info is the
    /// `chapter-v1` label. The derivation is deterministic: re-deriving with
    /// the same ids and root key always yields the same data key, so no key
    /// material needs to be stored for chapters in derived form.
    pub fn derive_chapter_key(
        &self,
        file_id: Uuid,
        chapter_id: Uuid,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let mut salt = [0u8; 32];
        salt[..16].copy_from_slice(chapter_id.as_bytes());
        salt[16..].copy_from_slice(file_id.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), self.key.as_ref());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(CHAPTER_KEY_INFO, okm.as_mut_slice())
            .map_err(|e| CryptoError::DerivationFailed(e.to_string()))?;
        Ok(okm)
    }

    /// Wrap a fresh data key with the root key using AES-256-GCM.
    ///
    /// The blob layout is `nonce(12) || ciphertext(32) || tag(16)` and is
    /// stored verbatim in the chapter row for chapters in wrapped form.
    pub fn wrap_data_key(&self, data_key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), data_key.as_ref())
            .map_err(|e| CryptoError::WrapFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(WRAPPED_KEY_LEN);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Unwrap a data key previously wrapped with [`RootKey::wrap_data_key`].
    pub fn unwrap_data_key(&self, blob: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if blob.len() != WRAPPED_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: WRAPPED_KEY_LEN,
                actual: blob.len(),
            });
        }

        let nonce = Nonce::from_slice(&blob[..12]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()));
        let plaintext = cipher
            .decrypt(nonce, &blob[12..])
            .map_err(|_| CryptoError::UnwrapFailed)?;

        if plaintext.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: plaintext.len(),
            });
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&plaintext);
        Ok(key)
    }
}

/// Rotating token signing key.
///
/// Reads vastly outnumber rotations, so the secret sits behind a
/// `parking_lot::RwLock`. Rotation bumps a generation counter; outstanding
/// tokens signed under the previous secret simply fail verification, which
/// is the invalidation behavior the token mint documents.
pub struct SigningKeyCell {
    inner: RwLock<SigningKeyState>,
}

struct SigningKeyState {
    secret: Zeroizing<Vec<u8>>,
    generation: u64,
}

impl std::fmt::Debug for SigningKeyCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyCell")
            .field("secret", &"[REDACTED]")
            .field("generation", &self.generation())
            .finish()
    }
}

impl SigningKeyCell {
    /// Create a cell holding the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            inner: RwLock::new(SigningKeyState {
                secret: Zeroizing::new(secret),
                generation: 0,
            }),
        }
    }

    /// Create a cell with a random 32-byte secret.
    pub fn random() -> Self {
        let mut secret = vec![0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    /// Run a closure with scoped access to the current secret.
    pub fn with_secret<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let state = self.inner.read();
        f(&state.secret)
    }

    /// Replace the secret with fresh random bytes, invalidating every token
    /// signed under the previous one. Returns the new generation number.
    pub fn rotate(&self) -> u64 {
        let mut secret = vec![0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let mut state = self.inner.write();
        state.secret = Zeroizing::new(secret);
        state.generation += 1;
        state.generation
    }

    /// Current rotation generation (0 until the first rotation).
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}
