//! Shared application state.
//!
//! A thin bundle of services; business logic lives in `sonavault-core`.

use std::sync::Arc;

use sonavault_core::Config;
use sonavault_core::auth::{AuthService, LoginPolicy};
use sonavault_core::chapter::ChapterCryptor;
use sonavault_core::crypto::{CryptoPool, SigningKeyCell};
use sonavault_core::store::Store;
use sonavault_core::token::TokenMint;
use sonavault_core::upload::UploadAssembler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthService>,
    pub uploads: Arc<UploadAssembler>,
    pub chapters: Arc<ChapterCryptor>,
    pub mint: Arc<TokenMint>,
    pub signing_keys: Arc<SigningKeyCell>,
    pub media_root: std::path::PathBuf,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Self {
        let pool = CryptoPool::default();

        let auth = Arc::new(AuthService::new(Arc::clone(&store), LoginPolicy::default()));
        let uploads = Arc::new(UploadAssembler::new(
            Arc::clone(&store),
            pool.clone(),
            &config.media_storage_root,
            config.max_chunk_bytes,
            config.upload_ttl,
        ));
        let chapters = Arc::new(ChapterCryptor::new(
            Arc::clone(&store),
            Arc::clone(&config.root_key),
            pool,
            &config.chapter_storage_root,
        ));
        let mint = Arc::new(TokenMint::new(
            Arc::clone(&config.signing_keys),
            config.token_ttl,
        ));

        Self {
            store,
            auth,
            uploads,
            chapters,
            mint,
            signing_keys: Arc::clone(&config.signing_keys),
            media_root: config.media_storage_root.clone(),
        }
    }
}
