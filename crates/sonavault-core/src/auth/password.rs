//! Password verifiers.
//!
//! Passwords are stored as salted scrypt digests and compared in constant
//! time. The verifier record carries its own cost parameters so they can be
//! raised without invalidating existing accounts.

use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// scrypt cost exponent for new verifiers (N = 2^15).
pub const DEFAULT_LOG_N: u8 = 15;
/// scrypt block size for new verifiers.
pub const DEFAULT_R: u32 = 8;
/// scrypt parallelism for new verifiers.
pub const DEFAULT_P: u32 = 1;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("invalid scrypt parameters: {0}")]
    InvalidParams(String),

    #[error("password hashing failed: {0}")]
    HashFailed(String),
}

/// Salted scrypt password verifier. Never leaves the server.
#[derive(Clone, Serialize, Deserialize)]
pub struct PasswordVerifier {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Hex-encoded scrypt output.
    pub hash: String,
}

impl std::fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordVerifier")
            .field("log_n", &self.log_n)
            .field("r", &self.r)
            .field("p", &self.p)
            .field("hash", &"[REDACTED]")
            .finish()
    }
}

impl PasswordVerifier {
    /// Create a verifier with the default work factor.
    pub fn create(password: &str) -> Result<Self, PasswordError> {
        Self::with_params(password, DEFAULT_LOG_N, DEFAULT_R, DEFAULT_P)
    }

    /// Create a verifier with explicit scrypt parameters. Tests use reduced
    /// parameters to keep suites fast.
    pub fn with_params(password: &str, log_n: u8, r: u32, p: u32) -> Result<Self, PasswordError> {
        let params = Params::new(log_n, r, p, HASH_LEN)
            .map_err(|e| PasswordError::InvalidParams(e.to_string()))?;

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);

        let mut out = [0u8; HASH_LEN];
        scrypt::scrypt(password.as_bytes(), &salt, &params, &mut out)
            .map_err(|e| PasswordError::HashFailed(e.to_string()))?;

        Ok(Self {
            log_n,
            r,
            p,
            salt: hex::encode(salt),
            hash: hex::encode(out),
        })
    }

    /// Check a password attempt against the stored digest in constant time.
    pub fn verify(&self, password: &str) -> Result<bool, PasswordError> {
        let params = Params::new(self.log_n, self.r, self.p, HASH_LEN)
            .map_err(|e| PasswordError::InvalidParams(e.to_string()))?;
        let salt = hex::decode(&self.salt)
            .map_err(|e| PasswordError::InvalidParams(format!("bad salt: {e}")))?;
        let expected = hex::decode(&self.hash)
            .map_err(|e| PasswordError::InvalidParams(format!("bad hash: {e}")))?;

        let mut out = vec![0u8; expected.len().max(1)];
        scrypt::scrypt(password.as_bytes(), &salt, &params, &mut out)
            .map_err(|e| PasswordError::HashFailed(e.to_string()))?;

        Ok(out.ct_eq(&expected).into())
    }
}

#[cfg(test)]
pub(crate) fn test_verifier(password: &str) -> PasswordVerifier {
    // log_n = 4 keeps the test suite fast; production uses DEFAULT_LOG_N.
    PasswordVerifier::with_params(password, 4, 8, 1).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_correct_password() {
        let verifier = test_verifier("hunter2!");
        assert!(verifier.verify("hunter2!").unwrap());
    }

    #[test]
    fn rejects_wrong_password() {
        let verifier = test_verifier("hunter2!");
        assert!(!verifier.verify("hunter3!").unwrap());
    }

    #[test]
    fn salts_differ_between_verifiers() {
        let a = test_verifier("same");
        let b = test_verifier("same");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn debug_redacts_hash() {
        let verifier = test_verifier("secret");
        let printed = format!("{verifier:?}");
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains(&verifier.hash));
    }
}
