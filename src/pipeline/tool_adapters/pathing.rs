use std::path::{Path, PathBuf};

use crate::pipeline::job::{image_extension, image_stem};

pub(super) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub(super) fn stem_of(path: &Path) -> String {
    image_stem(file_name_of(path).as_str()).to_string()
}

pub(super) fn parent_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub(super) fn has_extension(path: &Path, ext: &str) -> bool {
    image_extension(file_name_of(path).as_str()).as_deref() == Some(ext)
}

/// `<dir>/<stem>.<ext>` next to `path`.
pub(super) fn sibling_with_extension(path: &Path, ext: &str) -> PathBuf {
    parent_of(path).join(format!("{}.{ext}", stem_of(path)))
}

pub(crate) fn dir_arg(path: &Path) -> String {
    let mut value = path.to_string_lossy().to_string();
    if !value.ends_with('/') {
        value.push('/');
    }
    value
}
