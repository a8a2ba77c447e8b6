//! Sonavault core: the server-side audio protection pipeline.
//!
//! This crate implements the five cooperating subsystems behind the HTTP
//! surface in `sonavault-server`:
//!
//! - [`auth`] - credentialed login, per-device sessions, the single-device
//!   policy, and lock-out.
//! - [`upload`] - chunked, resumable, integrity-checked ingest of audio
//!   originals.
//! - [`chapter`] - per-chapter key derivation and framed AES-GCM segment
//!   encryption, plus random-access decryption for range serving.
//! - [`token`] - short-lived DRM session tokens, signed-URL tokens, and
//!   chapter stream tokens.
//! - [`stream`] - byte-source resolution for the range streaming engine.
//!
//! The entity store ([`store`]) is an external collaborator accessed
//! through a CRUD trait; [`store::MemoryStore`] is the in-process
//! implementation.

pub mod access;
pub mod auth;
pub mod chapter;
pub mod config;
pub mod crypto;
pub mod error;
pub mod library;
pub mod store;
pub mod stream;
pub mod token;
pub mod upload;

pub use config::{Config, ConfigError};
