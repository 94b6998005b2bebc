use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::similarity::{sync::DEFAULT_BATCH_SIZE, Metric, DEFAULT_K, DEFAULT_MODEL};

const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_METRIC: &str = "l2";
const DEFAULT_MAX_K: usize = 100;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings that define the vector index. Changing `model` or `metric`
/// requires a reindex.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Image model name (e.g. "resnet50", "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Distance metric: "l2" or "cosine"
    #[serde(default = "default_metric")]
    pub metric: String,

    /// Images embedded per batch during sync
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Threads for image loading during sync: "auto" or a positive integer
    #[serde(default = "default_embedding_parallelism")]
    pub embedding_parallelism: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            metric: default_metric(),
            batch_size: default_batch_size(),
            embedding_parallelism: default_embedding_parallelism(),
        }
    }
}

impl IndexConfig {
    pub fn metric(&self) -> Result<Metric, ConfigError> {
        self.metric
            .parse()
            .map_err(|e: crate::similarity::IndexError| ConfigError::Invalid(e.to_string()))
    }

    /// `None` means let rayon decide.
    pub fn parallelism(&self) -> Result<Option<usize>, ConfigError> {
        if self.embedding_parallelism == "auto" {
            return Ok(None);
        }
        match self.embedding_parallelism.parse::<usize>() {
            Ok(0) | Err(_) => Err(ConfigError::Invalid(format!(
                "index.embedding_parallelism must be 'auto' or a positive integer, got '{}'",
                self.embedding_parallelism
            ))),
            Ok(n) => Ok(Some(n)),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_metric() -> String {
    DEFAULT_METRIC.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_embedding_parallelism() -> String {
    "auto".to_string()
}

fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png"].iter().map(|s| s.to_string()).collect()
}

fn default_k() -> usize {
    DEFAULT_K
}

fn default_max_k() -> usize {
    DEFAULT_MAX_K
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Archive image directory; `<base>/corpus` when unset
    #[serde(default)]
    pub corpus_dir: Option<String>,

    /// File extensions treated as corpus images
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_k")]
    pub default_k: usize,

    #[serde(default = "default_max_k")]
    pub max_k: usize,

    /// Image shown for results missing from the corpus; a generated grey
    /// square when unset
    #[serde(default)]
    pub placeholder_image: Option<String>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus_dir: None,
            extensions: default_extensions(),
            listen_addr: default_listen_addr(),
            default_k: default_k(),
            max_k: default_max_k(),
            placeholder_image: None,
            index: IndexConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.index.metric()?;
        self.index.parallelism()?;

        if self.index.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "index.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.default_k == 0 || self.default_k > self.max_k {
            return Err(ConfigError::Invalid(format!(
                "default_k must be between 1 and max_k ({}), got {}",
                self.max_k, self.default_k
            )));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "extensions must list at least one file extension".to_string(),
            ));
        }
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if
    /// missing and re-saving it when new fields were filled in.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE_NAME);
        let io_err = |source| ConfigError::IO {
            path: path.clone(),
            source,
        };

        if !path.exists() {
            std::fs::create_dir_all(base_path).map_err(io_err)?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?).map_err(io_err)?;
        }

        let config_str = std::fs::read_to_string(&path).map_err(io_err)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE_NAME);
        let temp_path = path.with_extension("yaml.tmp");
        let config_str = serde_yml::to_string(&self)?;

        std::fs::write(&temp_path, config_str)
            .and_then(|_| std::fs::rename(&temp_path, &path))
            .map_err(|source| ConfigError::IO { path, source })
    }

    pub fn corpus_dir(&self) -> PathBuf {
        match &self.corpus_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.base_path.join("corpus"),
        }
    }

    /// Clamp a requested result count into `1..=max_k`, defaulting when
    /// absent.
    pub fn effective_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_k).clamp(1, self.max_k)
    }
}
