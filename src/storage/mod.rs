use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

pub const INPUT_DIR_NAME: &str = "LR";
pub const OUTPUT_DIR_NAME: &str = "results";

/// The two staging directories shared by every job. Only one job touches them
/// at a time; they are emptied before a job starts and after it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    pub fn under_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            input_dir: root.join(INPUT_DIR_NAME),
            output_dir: root.join(OUTPUT_DIR_NAME),
        }
    }

    pub fn input_dir(&self) -> &Path {
        self.input_dir.as_path()
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_path()
    }

    pub fn input_path(&self, file_name: &str) -> PathBuf {
        self.input_dir.join(file_name)
    }

    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.input_dir.as_path()).await?;
        fs::create_dir_all(self.output_dir.as_path()).await
    }

    /// Removes every entry of both staging directories, creating them if missing.
    /// Empties both staging directories. Both are attempted even when the
    /// first one fails; the first error is returned.
    pub async fn empty_dirs(&self) -> io::Result<()> {
        let outputs = empty_dir(self.output_dir.as_path()).await;
        let inputs = empty_dir(self.input_dir.as_path()).await;
        outputs.and(inputs)
    }

    pub async fn list_input(&self) -> io::Result<Vec<PathBuf>> {
        list_files_sorted(self.input_dir.as_path()).await
    }

    pub async fn list_output(&self) -> io::Result<Vec<PathBuf>> {
        list_files_sorted(self.output_dir.as_path()).await
    }
}

async fn empty_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut entries = fs::read_dir(dir).await?;
    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(path.as_path()).await?;
        } else {
            fs::remove_file(path.as_path()).await?;
        }
        removed += 1;
    }
    debug!(dir = %dir.display(), removed, "emptied staging directory");
    Ok(())
}

/// Regular files directly inside `dir`, sorted by path. A missing directory
/// lists as empty.
pub async fn list_files_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
pub(crate) fn temp_root(tag: &str) -> PathBuf {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("upscale_bot_{tag}_{stamp}"));
    std::fs::create_dir_all(root.as_path()).expect("temp root should exist");
    root
}
