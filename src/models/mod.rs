pub mod fuzzy;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::info;

use crate::pipeline::job::{ModelId, MODEL_FILE_EXTENSION};
use crate::storage::list_files_sorted;

/// Maps a user supplied model name onto a model that exists on disk.
pub trait ModelResolver: Send + Sync {
    fn resolve_model(&self, name: &str) -> Option<ModelId>;
}

/// Model file names found in the model directory, plus any added at runtime.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    dir: PathBuf,
    names: RwLock<Vec<String>>,
}

impl ModelRegistry {
    pub fn new(dir: impl Into<PathBuf>, names: Vec<String>) -> Self {
        let mut names = names;
        names.sort();
        names.dedup();
        Self {
            dir: dir.into(),
            names: RwLock::new(names),
        }
    }

    pub async fn from_dir(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        let names = list_files_sorted(dir)
            .await?
            .into_iter()
            .filter_map(|path| path.file_name().map(|v| v.to_string_lossy().to_string()))
            .filter(|name| name.ends_with(MODEL_FILE_EXTENSION))
            .collect::<Vec<_>>();
        info!(dir = %dir.display(), models = names.len(), "loaded model registry");
        Ok(Self::new(dir.to_path_buf(), names))
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.names
            .read()
            .map(|names| names.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .read()
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    /// Returns false when the name was already registered.
    pub fn add(&self, name: &str) -> bool {
        let Ok(mut names) = self.names.write() else {
            return false;
        };
        if names.iter().any(|n| n == name) {
            return false;
        }
        names.push(name.to_string());
        names.sort();
        true
    }
}

impl ModelResolver for ModelRegistry {
    fn resolve_model(&self, name: &str) -> Option<ModelId> {
        let names = self.names.read().ok()?;
        if let Some(exact) = names.iter().find(|n| n.as_str() == name) {
            return Some(ModelId::new(exact.clone()));
        }
        fuzzy::best_match(name, names.iter().map(String::as_str)).map(ModelId::new)
    }
}

/// `4xBox` becomes `4xBox.pth`; names already carrying the extension are kept.
pub fn with_model_extension(name: &str) -> String {
    if name.contains(MODEL_FILE_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{MODEL_FILE_EXTENSION}")
    }
}
