//! Query-side orchestration: image in, ranked neighbours out.

use std::sync::Arc;

use crate::similarity::embeddings::{self, EmbeddingError, ImageEmbedder};
use crate::similarity::index::{IndexError, Neighbor};
use crate::similarity::store::{StoreError, VectorStore};

/// Default number of results returned for a query
pub const DEFAULT_K: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query image rejected: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Store(#[from] StoreError),
}

impl QueryError {
    /// True when the caller sent something unusable rather than the
    /// service failing.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            QueryError::Embedding(EmbeddingError::Decode(_))
                | QueryError::Store(StoreError::Index(IndexError::ZeroNormVector))
        )
    }
}

/// Read-only search over a synchronized [`VectorStore`].
#[derive(Clone)]
pub struct QueryService {
    embedder: Arc<dyn ImageEmbedder>,
    store: Arc<VectorStore>,
}

impl QueryService {
    pub fn new(embedder: Arc<dyn ImageEmbedder>, store: Arc<VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Embed `image` and return its `k` nearest indexed neighbours, closest
    /// first.
    ///
    /// The image goes through the same normalization as corpus images. If it
    /// cannot be decoded or embedded the index is never queried.
    pub fn search(&self, image: &[u8], k: usize) -> Result<Vec<Neighbor>, QueryError> {
        let vector = embeddings::embed_image(self.embedder.as_ref(), image)?;
        let hits = self.store.query(&vector, k)?;
        log::debug!("query returned {} of {} requested results", hits.len(), k);
        Ok(hits)
    }
}
