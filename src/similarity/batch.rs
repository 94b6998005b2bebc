//! Lazy batch embedding over corpus items.
//!
//! [`EmbedBatches`] pulls `batch_size` items at a time, fetches and
//! normalizes them (on a rayon pool when one is given), and embeds the
//! survivors in one model call. Each vector travels with the
//! [`CorpusItem`] it came from; items that fail are reported in
//! [`EmbeddedBatch::skipped`] and never shift anyone else's vector.

use image::RgbImage;
use rayon::prelude::*;

use crate::images;
use crate::similarity::embeddings::ImageEmbedder;
use crate::similarity::identity::CorpusItem;
use crate::storage::CorpusSource;

/// An item left out of a batch, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedItem {
    pub item: CorpusItem,
    pub reason: String,
}

/// One batch worth of results.
#[derive(Debug, Default)]
pub struct EmbeddedBatch {
    pub embedded: Vec<(CorpusItem, Vec<f32>)>,
    pub skipped: Vec<SkippedItem>,
}

impl EmbeddedBatch {
    /// Number of input items this batch accounted for.
    pub fn len(&self) -> usize {
        self.embedded.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct EmbedBatches<'a> {
    items: std::vec::IntoIter<CorpusItem>,
    corpus: &'a dyn CorpusSource,
    embedder: &'a dyn ImageEmbedder,
    batch_size: usize,
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> EmbedBatches<'a> {
    pub fn new(
        items: Vec<CorpusItem>,
        corpus: &'a dyn CorpusSource,
        embedder: &'a dyn ImageEmbedder,
        batch_size: usize,
    ) -> Self {
        Self {
            items: items.into_iter(),
            corpus,
            embedder,
            batch_size: batch_size.max(1),
            pool: None,
        }
    }

    /// Fetch and decode on `pool` instead of the calling thread.
    pub fn with_pool(mut self, pool: &'a rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    fn load(&self, items: Vec<CorpusItem>) -> Vec<(CorpusItem, Result<RgbImage, String>)> {
        let corpus = self.corpus;
        let work = move || {
            items
                .into_par_iter()
                .map(|item| {
                    let image = corpus
                        .fetch(&item.name)
                        .map_err(|e| e.to_string())
                        .and_then(|bytes| images::normalize(&bytes).map_err(|e| e.to_string()));
                    (item, image)
                })
                .collect::<Vec<_>>()
        };
        match self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    /// Embed the loaded images, falling back to one call per image when the
    /// batched call fails so a single bad input only costs itself.
    fn embed(&self, loaded: Vec<(CorpusItem, RgbImage)>, batch: &mut EmbeddedBatch) {
        let (items, images): (Vec<CorpusItem>, Vec<RgbImage>) = loaded.into_iter().unzip();

        match self.embedder.embed_images(&images) {
            Ok(vectors) if vectors.len() == items.len() => {
                batch.embedded.extend(items.into_iter().zip(vectors));
            }
            outcome => {
                if let Err(err) = outcome {
                    log::warn!("batch embedding failed ({err}), retrying item by item");
                }
                for (item, image) in items.into_iter().zip(images) {
                    match self.embedder.embed_images(std::slice::from_ref(&image)) {
                        Ok(mut vectors) if vectors.len() == 1 => {
                            let vector = vectors.remove(0);
                            batch.embedded.push((item, vector));
                        }
                        Ok(vectors) => batch.skipped.push(SkippedItem {
                            item,
                            reason: format!("model returned {} embeddings for 1 image", vectors.len()),
                        }),
                        Err(err) => batch.skipped.push(SkippedItem {
                            item,
                            reason: err.to_string(),
                        }),
                    }
                }
            }
        }
    }
}

impl Iterator for EmbedBatches<'_> {
    type Item = EmbeddedBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<CorpusItem> = self.items.by_ref().take(self.batch_size).collect();
        if chunk.is_empty() {
            return None;
        }

        let mut batch = EmbeddedBatch::default();
        let mut loaded = Vec::with_capacity(chunk.len());
        for (item, image) in self.load(chunk) {
            match image {
                Ok(image) => loaded.push((item, image)),
                Err(reason) => {
                    log::error!("Error while loading image {:?}: {reason}", item.name);
                    batch.skipped.push(SkippedItem { item, reason });
                }
            }
        }

        if !loaded.is_empty() {
            self.embed(loaded, &mut batch);
        }

        Some(batch)
    }
}
