use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::{
    app::errors::AppError,
    config::Config,
    images,
    similarity::{
        identifier, sync::SyncPlan, CancelFlag, ImageEmbedder, IndexSynchronizer, Neighbor, QueryService,
        SyncProgress, SyncReport, VectorStore,
    },
    storage::{CorpusError, CorpusSource},
};

/// Bytes to show for a corpus item.
#[derive(Debug, Clone)]
pub struct DisplayImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    /// The item could not be fetched and the placeholder was substituted
    pub is_placeholder: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub model: String,
    pub metric: String,
    pub dimensions: usize,
    pub indexed: usize,
}

/// Everything a command or request needs, built once by
/// [`crate::app::AppFactory`].
pub struct AppContext {
    config: Config,
    corpus: Arc<dyn CorpusSource>,
    embedder: Arc<dyn ImageEmbedder>,
    store: Arc<VectorStore>,
    pool: Option<rayon::ThreadPool>,
    placeholder: Vec<u8>,
}

impl AppContext {
    pub fn new(
        config: Config,
        corpus: Arc<dyn CorpusSource>,
        embedder: Arc<dyn ImageEmbedder>,
        store: Arc<VectorStore>,
    ) -> Result<Self, AppError> {
        let pool = match config.index.parallelism()? {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("embed-load-{i}"))
                    .build()
                    .map_err(|err| AppError::Other(err.into()))?,
            ),
            None => None,
        };

        let placeholder = match &config.placeholder_image {
            Some(path) => std::fs::read(path)?,
            None => images::placeholder_png()?,
        };

        Ok(Self {
            config,
            corpus,
            embedder,
            store,
            pool,
            placeholder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Synchronizer wired with the configured batch size and pool.
    pub fn synchronizer(&self, batch_size: Option<usize>) -> IndexSynchronizer<'_> {
        let synchronizer = IndexSynchronizer::new(
            self.corpus.as_ref(),
            self.embedder.as_ref(),
            &self.store,
        )
        .with_batch_size(batch_size.unwrap_or(self.config.index.batch_size));

        match &self.pool {
            Some(pool) => synchronizer.with_pool(pool),
            None => synchronizer,
        }
    }

    /// Compute the delta without embedding anything.
    pub fn plan_sync(&self) -> Result<SyncPlan, AppError> {
        Ok(self.synchronizer(None).plan()?)
    }

    pub fn sync(
        &self,
        batch_size: Option<usize>,
        cancel: CancelFlag,
        observer: &mut dyn FnMut(&SyncProgress),
    ) -> Result<SyncReport, AppError> {
        let report = self
            .synchronizer(batch_size)
            .with_cancel(cancel)
            .run(observer)?;

        for skipped in &report.skipped {
            log::warn!("not indexed: {:?} ({})", skipped.item.name, skipped.reason);
        }
        Ok(report)
    }

    pub fn query_service(&self) -> QueryService {
        QueryService::new(self.embedder.clone(), self.store.clone())
    }

    /// Search with `k` defaulted and capped by the config.
    pub fn search(&self, image: &[u8], k: Option<usize>) -> Result<Vec<Neighbor>, AppError> {
        let k = self.config.effective_k(k);
        Ok(self.query_service().search(image, k)?)
    }

    /// Fetch an item for display, substituting the placeholder when it is
    /// gone from the corpus.
    pub fn display_image(&self, name: &str) -> Result<DisplayImage, AppError> {
        match self.corpus.fetch(name) {
            Ok(bytes) => Ok(DisplayImage {
                content_type: images::mime_type(&bytes),
                bytes,
                is_placeholder: false,
            }),
            Err(CorpusError::NotFound(_)) => {
                log::warn!("{name:?} is indexed but missing from the corpus, showing placeholder");
                Ok(DisplayImage {
                    content_type: images::mime_type(&self.placeholder),
                    bytes: self.placeholder.clone(),
                    is_placeholder: true,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn status(&self) -> Result<IndexStatus, AppError> {
        Ok(IndexStatus {
            model: self.embedder.model_name().to_string(),
            metric: self.store.metric().to_string(),
            dimensions: self.store.dimensions(),
            indexed: self.store.len()?,
        })
    }

    /// Indexed entries whose name is no longer listed by the corpus, as
    /// `(id, name)` pairs.
    pub fn stale_entries(&self) -> Result<Vec<(String, String)>, AppError> {
        let listed: HashSet<String> = self
            .corpus
            .list_all_names()?
            .iter()
            .map(|name| identifier(name))
            .collect();

        Ok(self
            .store
            .names()?
            .into_iter()
            .filter(|(id, _)| !listed.contains(id))
            .collect())
    }

    /// Remove the given entries from the index.
    pub fn prune(&self, stale: &[(String, String)]) -> Result<usize, AppError> {
        let ids: HashSet<String> = stale.iter().map(|(id, _)| id.clone()).collect();
        let removed = self.store.remove(&ids)?;
        log::info!("pruned {removed} entries");
        Ok(removed)
    }
}
