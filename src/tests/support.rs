//! Shared fixtures: a deterministic embedder and on-disk image corpora.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};

use crate::app::{AppContext, AppFactory, AppPaths};
use crate::config::Config;
use crate::similarity::{EmbeddingError, ImageEmbedder, Metric, VectorStore};
use crate::storage::BackendLocal;

/// Embeds an image as the mean luma of its four quadrants, scaled to 0..1.
///
/// Solid images of different shades land at different points, identical
/// images land on the same point.
#[derive(Default)]
pub struct QuadrantEmbedder {
    calls: AtomicUsize,
    images: AtomicUsize,
    /// Reject any call with more than one image
    single_only: bool,
}

impl QuadrantEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single_only() -> Self {
        Self {
            single_only: true,
            ..Self::default()
        }
    }

    /// Number of `embed_images` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of images passed to the model so far
    pub fn images(&self) -> usize {
        self.images.load(Ordering::SeqCst)
    }
}

impl ImageEmbedder for QuadrantEmbedder {
    fn model_name(&self) -> &str {
        "quadrant-luma"
    }

    fn dimensions(&self) -> usize {
        4
    }

    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.images.fetch_add(images.len(), Ordering::SeqCst);

        if self.single_only && images.len() > 1 {
            return Err(EmbeddingError::EmbeddingFailed(
                "batch inference unavailable".to_string(),
            ));
        }
        Ok(images.iter().map(quadrant_means).collect())
    }
}

pub fn quadrant_means(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut sums = [0f32; 4];
    let mut counts = [0usize; 4];

    for (x, y, pixel) in img.enumerate_pixels() {
        let quadrant = usize::from(x * 2 >= width) + 2 * usize::from(y * 2 >= height);
        sums[quadrant] += f32::from(pixel[0]);
        counts[quadrant] += 1;
    }

    sums.iter()
        .zip(counts)
        .map(|(sum, count)| if count == 0 { 0.0 } else { sum / count as f32 / 255.0 })
        .collect()
}

/// Write a solid grey image; the format follows the extension.
pub fn write_image(dir: &Path, name: &str, shade: u8) -> PathBuf {
    write_quadrants(dir, name, [shade; 4])
}

/// Write a 16x16 image whose quadrants have the given shades (top-left,
/// top-right, bottom-left, bottom-right).
pub fn write_quadrants(dir: &Path, name: &str, shades: [u8; 4]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }

    let img = RgbImage::from_fn(16, 16, |x, y| {
        let quadrant = usize::from(x >= 8) + 2 * usize::from(y >= 8);
        let shade = shades[quadrant];
        Rgb([shade, shade, shade])
    });
    img.save(&path).unwrap();
    path
}

pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\xff\xd8 definitely not a jpeg").unwrap();
    path
}

pub fn extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

/// A corpus directory, an index directory and a fake model.
pub struct Fixture {
    pub corpus_dir: PathBuf,
    pub index_dir: PathBuf,
    /// Scratch space outside the corpus, for query images
    pub queries_dir: PathBuf,
    pub corpus: BackendLocal,
    pub embedder: Arc<QuadrantEmbedder>,
    _tmp: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_embedder(QuadrantEmbedder::new())
    }

    pub fn with_embedder(embedder: QuadrantEmbedder) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let corpus_dir = tmp.path().join("corpus");
        let index_dir = tmp.path().join("index");
        let queries_dir = tmp.path().join("queries");
        let corpus = BackendLocal::new(&corpus_dir, &extensions()).unwrap();

        Self {
            corpus_dir,
            index_dir,
            queries_dir,
            corpus,
            embedder: Arc::new(embedder),
            _tmp: tmp,
        }
    }

    pub fn open_store(&self, metric: Metric) -> VectorStore {
        VectorStore::open(
            &self.index_dir,
            self.embedder.model_id_hash(),
            self.embedder.dimensions(),
            metric,
        )
        .unwrap()
    }

    /// Full application context over this fixture, with `adjust` applied to
    /// the freshly created config.
    pub fn app_with(&self, adjust: impl FnOnce(&mut Config)) -> AppContext {
        let paths = AppPaths {
            base_path: self.index_dir.clone(),
        };
        let mut config = Config::load_with(&paths.base_path).unwrap();
        config.corpus_dir = Some(self.corpus_dir.to_string_lossy().into_owned());
        adjust(&mut config);

        AppFactory::build_with(
            &paths,
            config,
            Arc::new(self.corpus.clone()),
            self.embedder.clone(),
        )
        .unwrap()
    }

    pub fn app(&self) -> AppContext {
        self.app_with(|_| {})
    }
}
