//! Error types for the core crate.
//!
//! Each module owns its error enum; this module re-exports them so callers
//! have one place to import from.

pub use crate::auth::password::PasswordError;
pub use crate::auth::service::AuthError;
pub use crate::chapter::ChapterError;
pub use crate::chapter::cipher::{SegmentContext, SegmentDecryptError, SegmentEncryptError};
pub use crate::config::ConfigError;
pub use crate::crypto::CryptoError;
pub use crate::store::StoreError;
pub use crate::stream::StreamError;
pub use crate::token::TokenError;
pub use crate::upload::UploadError;
