use crate::config::ConfigError;
use crate::similarity::{EmbeddingError, QueryError, StoreError, SyncError};
use crate::storage::CorpusError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Query(#[from] QueryError),

    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Corpus(#[from] CorpusError),

    #[error("embedding model error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Base64: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Caller-side problems: unreadable uploads, bad names.
    pub fn is_bad_input(&self) -> bool {
        match self {
            AppError::Query(err) => err.is_bad_input(),
            AppError::Embedding(EmbeddingError::Decode(_)) => true,
            AppError::Corpus(CorpusError::InvalidName(_)) => true,
            AppError::Base64(_) => true,
            _ => false,
        }
    }
}
