use std::path::PathBuf;

use crate::pipeline::runtime::default_app_root_from_manifest_dir;

/// Binaries and helper scripts the image tool adapters shell out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAdapterConfig {
    pub magick_binary: String,
    pub optipng_binary: String,
    pub optipng_level: u8,
    pub scripts_dir: PathBuf,
    pub split_script: String,
    pub merge_script: String,
    pub montage_script: String,
    pub montage_font: String,
    pub staging_dir_name: String,
}

impl Default for ToolAdapterConfig {
    fn default() -> Self {
        Self {
            magick_binary: String::from("magick"),
            optipng_binary: String::from("optipng"),
            optipng_level: 2,
            scripts_dir: default_app_root_from_manifest_dir().join("scripts"),
            split_script: String::from("split.sh"),
            merge_script: String::from("merge.sh"),
            montage_script: String::from("montage.sh"),
            montage_font: String::from("Rubik-Bold.ttf"),
            staging_dir_name: String::from("_TMP"),
        }
    }
}

impl ToolAdapterConfig {
    pub(super) fn script_path(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }
}
