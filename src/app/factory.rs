use crate::{
    app::context::AppContext,
    config::Config,
    similarity::{FastembedImageModel, ImageEmbedder, VectorStore},
    storage::{BackendLocal, CorpusSource},
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Build the full context: config, local corpus, fastembed model and the
    /// persisted index.
    pub fn build_context(paths: &AppPaths) -> Result<AppContext> {
        let config = Self::create_config(paths)?;

        let corpus_dir = config.corpus_dir();
        let corpus = BackendLocal::new(&corpus_dir, &config.extensions)
            .with_context(|| format!("Failed to open corpus at {}", corpus_dir.display()))?;
        log::info!("corpus: {}", corpus_dir.display());

        let embedder = FastembedImageModel::new(&config.index.model, paths.base_path.clone())
            .context("Failed to load embedding model")?;

        Self::build_with(paths, config, Arc::new(corpus), Arc::new(embedder))
    }

    /// Assemble a context around an already constructed corpus and embedder.
    pub fn build_with(
        paths: &AppPaths,
        config: Config,
        corpus: Arc<dyn CorpusSource>,
        embedder: Arc<dyn ImageEmbedder>,
    ) -> Result<AppContext> {
        let metric = config.index.metric()?;
        let store = VectorStore::open(
            &paths.base_path,
            embedder.model_id_hash(),
            embedder.dimensions(),
            metric,
        )
        .with_context(|| {
            format!(
                "Failed to open index at {} (run `reindex` after changing index.model or index.metric)",
                paths.base_path.display()
            )
        })?;

        Ok(AppContext::new(config, corpus, embedder, Arc::new(store))?)
    }

    /// Get application paths, creating the base directory if needed
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths { base_path })
    }

    /// Load and validate configuration
    pub fn create_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path).context("Failed to load config.yaml")
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("ARCHIVE_SEARCH_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .map_err(|err| anyhow::anyhow!("Could not determine home directory: {err:?}"))?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/archive-search"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Holds `config.yaml`, `vectors.bin`, `index.lock` and the model cache
    pub base_path: PathBuf,
}
