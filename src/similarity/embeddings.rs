//! Image embedding models.
//!
//! [`ImageEmbedder`] is the boundary to the feature extractor: it only ever
//! sees images that already went through [`crate::images::normalize`].
//! [`FastembedImageModel`] is the production implementation:
//! - Model download with configurable cache directory
//! - Dimensions detected once at load time
//! - Batch embedding generation

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageInitOptions};
use image::RgbImage;
use sha2::{Digest, Sha256};

use crate::images::{self, PREPROCESS_CONVENTION};

/// Side length of the blank image used to detect output dimensions
const PROBE_SIZE: u32 = 32;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model returned {got} embeddings for {expected} images")]
    CountMismatch { expected: usize, got: usize },

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Feature extractor turning normalized images into fixed-length vectors.
pub trait ImageEmbedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed a batch. Output order matches input order.
    fn embed_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Identity of the vectors this embedder produces: SHA256 over the
    /// model name and the preprocessing convention.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.model_name().as_bytes());
        hasher.update(b"\0");
        hasher.update(PREPROCESS_CONVENTION.as_bytes());
        hasher.finalize().into()
    }
}

/// Embed a single encoded image.
///
/// Undecodable input is an error; no vector is produced for it.
pub fn embed_image(embedder: &dyn ImageEmbedder, data: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    let image = images::normalize(data)?;
    embedder
        .embed_images(std::slice::from_ref(&image))?
        .into_iter()
        .next()
        .ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed calls require &mut self.
pub struct FastembedImageModel {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastembedImageModel {
    /// Load the named model, downloading it into `cache_dir/models` on first
    /// use.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = ImageEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::detect_dimensions(&mut model)?;
        log::info!("loaded image model '{model_name}' ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.trim().to_lowercase(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::ImageEmbeddingModel, EmbeddingError> {
        match name.trim().to_lowercase().as_str() {
            "resnet50" | "resnet-50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
            "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
            "unicom-vit-b-16" | "unicomvitb16" => {
                Ok(fastembed::ImageEmbeddingModel::UnicomVitB16)
            }
            "unicom-vit-b-32" | "unicomvitb32" => {
                Ok(fastembed::ImageEmbeddingModel::UnicomVitB32)
            }
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: resnet50, clip-vit-b-32, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
                name
            ))),
        }
    }

    fn detect_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbeddingError> {
        let blank = RgbImage::from_pixel(PROBE_SIZE, PROBE_SIZE, image::Rgb([128, 128, 128]));
        let png = images::encode_png(&blank)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to build blank image: {e}")))?;

        let embeddings = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl ImageEmbedder for FastembedImageModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_images(&self, batch: &[RgbImage]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        // fastembed takes encoded bytes and does its own resize/normalize
        let encoded = batch
            .iter()
            .map(images::encode_png)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;
        let slices: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&slices, Some(slices.len()))
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != batch.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: batch.len(),
                got: embeddings.len(),
            });
        }
        Ok(embeddings)
    }
}
