//! Reconciliation of the corpus listing with the vector index.
//!
//! 1. list every corpus name
//! 2. derive identifiers
//! 3. keep the names whose identifier the index does not have yet
//! 4. embed that delta batch by batch, reporting progress after each batch
//! 5. upsert every finished batch
//!
//! Running it twice against an unchanged corpus embeds nothing the second
//! time. The synchronizer never removes entries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::similarity::batch::{EmbedBatches, SkippedItem};
use crate::similarity::embeddings::ImageEmbedder;
use crate::similarity::identity::CorpusItem;
use crate::similarity::index::{EntryMetadata, IndexEntry};
use crate::similarity::store::{StoreError, VectorStore};
use crate::storage::{CorpusError, CorpusSource};

/// Default number of images embedded per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Corpus listing failed: {0}")]
    Corpus(#[from] CorpusError),

    #[error("Index error: {0}")]
    Store(#[from] StoreError),
}

/// Shared flag checked between batches.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    /// Delta items handled so far, embedded or skipped
    pub processed: usize,
    /// Size of the delta
    pub total: usize,
    pub embedded: usize,
    pub skipped: usize,
}

impl SyncProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f32 / self.total as f32
        }
    }
}

/// What a sync would do, before any embedding.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub listed: usize,
    pub already_indexed: usize,
    pub delta: Vec<CorpusItem>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub listed: usize,
    pub already_indexed: usize,
    pub delta: usize,
    pub embedded: usize,
    pub skipped: Vec<SkippedItem>,
    pub cancelled: bool,
}

pub struct IndexSynchronizer<'a> {
    corpus: &'a dyn CorpusSource,
    embedder: &'a dyn ImageEmbedder,
    store: &'a VectorStore,
    batch_size: usize,
    pool: Option<&'a rayon::ThreadPool>,
    cancel: CancelFlag,
}

impl<'a> IndexSynchronizer<'a> {
    pub fn new(
        corpus: &'a dyn CorpusSource,
        embedder: &'a dyn ImageEmbedder,
        store: &'a VectorStore,
    ) -> Self {
        Self {
            corpus,
            embedder,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            pool: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_pool(mut self, pool: &'a rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Steps 1-3: list, identify, compute the delta.
    pub fn plan(&self) -> Result<SyncPlan, SyncError> {
        let names = self.corpus.list_all_names()?;
        let listed = names.len();

        let mut seen = HashSet::with_capacity(listed);
        let mut items = Vec::with_capacity(listed);
        for name in names {
            let item = CorpusItem::new(name);
            if seen.insert(item.identifier.clone()) {
                items.push(item);
            } else {
                log::warn!(
                    "{:?} has the same identifier as an earlier item, skipping",
                    item.name
                );
            }
        }

        let existing = self.store.exists(&seen)?;
        let delta: Vec<CorpusItem> = items
            .into_iter()
            .filter(|item| !existing.contains(&item.identifier))
            .collect();

        Ok(SyncPlan {
            listed,
            already_indexed: existing.len(),
            delta,
        })
    }

    /// Run a full sync, calling `observer` after every batch.
    pub fn run(&self, observer: &mut dyn FnMut(&SyncProgress)) -> Result<SyncReport, SyncError> {
        let plan = self.plan()?;
        let total = plan.delta.len();
        let mut report = SyncReport {
            listed: plan.listed,
            already_indexed: plan.already_indexed,
            delta: total,
            ..Default::default()
        };

        if total == 0 {
            log::info!("index up to date ({} items)", plan.already_indexed);
            return Ok(report);
        }

        log::info!("embedding {total} new images");
        let mut batches =
            EmbedBatches::new(plan.delta, self.corpus, self.embedder, self.batch_size);
        if let Some(pool) = self.pool {
            batches = batches.with_pool(pool);
        }

        let metric = self.store.metric();
        let mut processed = 0;
        loop {
            if self.cancel.is_cancelled() {
                log::warn!("sync cancelled after {processed}/{total} items");
                report.cancelled = true;
                break;
            }
            let Some(batch) = batches.next() else {
                break;
            };

            processed += batch.len();
            report.skipped.extend(batch.skipped);

            let mut entries = Vec::with_capacity(batch.embedded.len());
            for (item, vector) in batch.embedded {
                if !metric.admits(&vector) {
                    log::error!("{:?} produced a zero vector, skipping", item.name);
                    report.skipped.push(SkippedItem {
                        item,
                        reason: "zero-norm embedding".to_string(),
                    });
                    continue;
                }
                entries.push(IndexEntry {
                    id: item.identifier,
                    vector,
                    metadata: EntryMetadata {
                        path: self.corpus.location(&item.name),
                        name: item.name,
                    },
                });
            }

            report.embedded += entries.len();
            self.store.upsert(entries)?;

            observer(&SyncProgress {
                processed,
                total,
                embedded: report.embedded,
                skipped: report.skipped.len(),
            });
        }

        log::info!(
            "{} embeddings computed, {} images skipped",
            report.embedded,
            report.skipped.len()
        );
        Ok(report)
    }
}
