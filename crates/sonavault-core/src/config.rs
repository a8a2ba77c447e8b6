//! Typed server configuration.
//!
//! All recognized options are environment variables; `ROOT_KEY` is the one
//! mandatory setting and its absence is a fatal startup error. The binary
//! layers clap overrides on top of this (see the server crate).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;

use crate::crypto::{CryptoError, RootKey, SigningKeyCell};

/// Default stream-token TTL: 30 minutes.
pub const DEFAULT_TOKEN_TTL_MS: i64 = 1_800_000;
/// Default upload chunk ceiling: 5 MiB.
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 5 * 1024 * 1024;
/// Default upload session TTL: 24 hours.
pub const DEFAULT_UPLOAD_TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Default bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8340";

#[derive(Error, Debug)]
pub enum ConfigError {
    /// `ROOT_KEY` is missing. Fatal: the server cannot protect anything
    /// without it.
    #[error("ROOT_KEY is not set; supply a 32-byte hex secret")]
    MissingRootKey,

    #[error("invalid ROOT_KEY: {0}")]
    BadRootKey(#[from] CryptoError),

    #[error("invalid value for {name}: {value}")]
    BadValue { name: &'static str, value: String },
}

/// Fully parsed configuration set.
pub struct Config {
    pub root_key: Arc<RootKey>,
    pub signing_keys: Arc<SigningKeyCell>,
    pub token_ttl: Duration,
    pub max_chunk_bytes: u64,
    pub upload_ttl: Duration,
    pub chapter_storage_root: PathBuf,
    pub media_storage_root: PathBuf,
    /// Connection string for the external entity store. The in-process
    /// store ignores it; it is parsed so misconfiguration fails loudly.
    pub db_url: Option<String>,
    pub bind_address: SocketAddr,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root_key", &"[REDACTED]")
            .field("token_ttl", &self.token_ttl)
            .field("max_chunk_bytes", &self.max_chunk_bytes)
            .field("upload_ttl", &self.upload_ttl)
            .field("chapter_storage_root", &self.chapter_storage_root)
            .field("media_storage_root", &self.media_storage_root)
            .field("bind_address", &self.bind_address)
            .finish_non_exhaustive()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_ms(name: &'static str, default: i64) -> Result<Duration, ConfigError> {
    match env_var(name) {
        None => Ok(Duration::milliseconds(default)),
        Some(value) => value
            .parse::<i64>()
            .map(Duration::milliseconds)
            .map_err(|_| ConfigError::BadValue { name, value }),
    }
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let root_key = env_var("ROOT_KEY").ok_or(ConfigError::MissingRootKey)?;
        let root_key = Arc::new(RootKey::from_hex(&root_key)?);

        let signing_keys = match env_var("TOKEN_SIGNING_KEY") {
            Some(secret) => Arc::new(SigningKeyCell::new(secret.into_bytes())),
            // No configured key: generate one. Tokens then survive only as
            // long as the process, which is fine for single-node setups.
            None => Arc::new(SigningKeyCell::random()),
        };

        let token_ttl = parse_ms("TOKEN_TTL_MS", DEFAULT_TOKEN_TTL_MS)?;
        let upload_ttl = parse_ms("UPLOAD_TTL_MS", DEFAULT_UPLOAD_TTL_MS)?;

        let max_chunk_bytes = match env_var("MAX_CHUNK_BYTES") {
            None => DEFAULT_MAX_CHUNK_BYTES,
            Some(value) => value.parse().map_err(|_| ConfigError::BadValue {
                name: "MAX_CHUNK_BYTES",
                value,
            })?,
        };

        let chapter_storage_root = env_var("CHAPTER_STORAGE_ROOT")
            .map_or_else(|| PathBuf::from("./data/chapters"), PathBuf::from);
        let media_storage_root = env_var("MEDIA_STORAGE_ROOT")
            .map_or_else(|| PathBuf::from("./data/media"), PathBuf::from);

        let bind_address = match env_var("BIND_ADDRESS") {
            None => DEFAULT_BIND_ADDRESS.parse().expect("default bind address"),
            Some(value) => value.parse().map_err(|_| ConfigError::BadValue {
                name: "BIND_ADDRESS",
                value,
            })?,
        };

        Ok(Self {
            root_key,
            signing_keys,
            token_ttl,
            max_chunk_bytes,
            upload_ttl,
            chapter_storage_root,
            media_storage_root,
            db_url: env_var("DB_URL"),
            bind_address,
        })
    }

    /// A configuration suitable for tests and local demos: random keys,
    /// storage under the given root.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root_key: Arc::new(RootKey::random()),
            signing_keys: Arc::new(SigningKeyCell::random()),
            token_ttl: Duration::milliseconds(DEFAULT_TOKEN_TTL_MS),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            upload_ttl: Duration::milliseconds(DEFAULT_UPLOAD_TTL_MS),
            chapter_storage_root: root.join("chapters"),
            media_storage_root: root.join("media"),
            db_url: None,
            bind_address: "127.0.0.1:0".parse().expect("loopback bind address"),
        }
    }
}
