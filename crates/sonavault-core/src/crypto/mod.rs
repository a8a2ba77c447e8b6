//! Cryptographic primitives for chapter protection.
//!
//! The key hierarchy is two levels deep: a process-wide [`RootKey`] loaded
//! from configuration, and one data key per chapter. Data keys are either
//! derived with HKDF-SHA256 (salt = chapter id || file id) or generated
//! fresh and wrapped with the root key using AES-256-GCM; the chapter row
//! records which form is in use.

pub mod keys;
pub mod pool;

use thiserror::Error;

/// Errors that can occur during key-level cryptographic operations.
///
/// Unwrap failures are indistinguishable from tampering by construction:
/// a wrong root key and a modified wrap blob both fail the GCM tag check.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The root key string in configuration could not be decoded.
    #[error("invalid root key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Unwrapping a wrapped data key failed the authentication check.
    #[error("data key unwrap failed - wrong root key or tampered key blob")]
    UnwrapFailed,

    /// Wrapping a data key failed unexpectedly.
    #[error("data key wrap failed: {0}")]
    WrapFailed(String),

    /// HKDF expansion failed (invalid output length).
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),
}

pub use keys::{RootKey, SigningKeyCell};
pub use pool::CryptoPool;
