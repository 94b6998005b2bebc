use std::path::{Component, Path, PathBuf};

/// Authoritative listing of archive images.
pub trait CorpusSource: Send + Sync {
    /// Every item name in the corpus, sorted.
    fn list_all_names(&self) -> Result<Vec<String>, CorpusError>;
    fn fetch(&self, name: &str) -> Result<Vec<u8>, CorpusError>;
    /// Where an item lives, recorded as the entry's `path` metadata.
    fn location(&self, name: &str) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("corpus item not found: {0}")]
    NotFound(String),

    #[error("invalid corpus item name: {0:?}")]
    InvalidName(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),
}

/// Corpus backed by a local directory tree.
///
/// Item names are `/`-separated paths relative to `base_dir`.
#[derive(Clone)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
    extensions: Vec<String>,
}

impl BackendLocal {
    pub fn new(corpus_dir: &Path, extensions: &[String]) -> std::io::Result<Self> {
        std::fs::create_dir_all(corpus_dir)?;
        Ok(BackendLocal {
            base_dir: corpus_dir.to_path_buf(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        })
    }

    /// Map an item name to a path under `base_dir`, refusing anything that
    /// could escape it.
    fn resolve(&self, name: &str) -> Result<PathBuf, CorpusError> {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe || name.split('/').any(str::is_empty) {
            return Err(CorpusError::InvalidName(name.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    fn has_wanted_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|wanted| *wanted == ext.to_lowercase()))
            .unwrap_or(false)
    }

    fn walk(&self, dir: &Path, prefix: &str, names: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                log::warn!("skipping non UTF-8 file name in {}", dir.display());
                continue;
            };
            let name = if prefix.is_empty() {
                file_name.to_string()
            } else {
                format!("{prefix}/{file_name}")
            };

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(&entry.path(), &name, names)?;
            } else if file_type.is_file() && self.has_wanted_extension(&entry.path()) {
                names.push(name);
            }
        }
        Ok(())
    }
}

impl CorpusSource for BackendLocal {
    fn list_all_names(&self) -> Result<Vec<String>, CorpusError> {
        let mut names = Vec::new();
        self.walk(&self.base_dir, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    fn fetch(&self, name: &str) -> Result<Vec<u8>, CorpusError> {
        let path = self.resolve(name)?;
        std::fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => CorpusError::NotFound(name.to_string()),
            _ => CorpusError::IO(err),
        })
    }

    fn location(&self, name: &str) -> String {
        self.base_dir.join(name).to_string_lossy().into_owned()
    }
}
