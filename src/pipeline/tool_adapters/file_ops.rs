use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::storage::list_files_sorted;

pub(super) async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

pub(super) async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

pub(crate) async fn snapshot_files(dir: &Path) -> io::Result<BTreeSet<PathBuf>> {
    Ok(list_files_sorted(dir).await?.into_iter().collect())
}

/// Deletes files in `dir` that were not present in `before`.
pub(super) async fn remove_new_files(dir: &Path, before: &BTreeSet<PathBuf>) -> io::Result<usize> {
    let mut removed = 0usize;
    for path in list_files_sorted(dir).await? {
        if !before.contains(&path) && remove_file_if_exists(path.as_path()).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

pub(super) async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_root;

    #[tokio::test]
    async fn remove_new_files_keeps_preexisting_files() {
        let root = temp_root("file_ops_new_files");
        std::fs::write(root.join("cat.png"), b"x").expect("original");
        let before = snapshot_files(root.as_path()).await.expect("snapshot");
        std::fs::write(root.join("cat_tile_0.png"), b"t").expect("tile 0");
        std::fs::write(root.join("cat_tile_1.png"), b"t").expect("tile 1");

        let removed = remove_new_files(root.as_path(), &before)
            .await
            .expect("cleanup should succeed");

        assert_eq!(removed, 2);
        assert!(root.join("cat.png").is_file());
        assert!(!root.join("cat_tile_0.png").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn remove_if_exists_tolerates_missing_paths() {
        let root = temp_root("file_ops_missing");
        assert!(!remove_file_if_exists(root.join("nope.png").as_path())
            .await
            .expect("missing file is fine"));
        assert!(!remove_dir_if_exists(root.join("nope").as_path())
            .await
            .expect("missing dir is fine"));

        let _ = std::fs::remove_dir_all(root);
    }
}
