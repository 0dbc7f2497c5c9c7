use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::pipeline::execution::PipelineLimits;
use crate::pipeline::executor::ESRGAN_MODELS_DIR_NAME;
use crate::pipeline::tool_adapters::ToolAdapterConfig;
use crate::storage::Workspace;

pub const DEFAULT_SETTINGS_RELATIVE_PATH: &str = "config/bot.settings.toml";
pub const ENV_PREFIX: &str = "UPSCALE_BOT_PREFIX";
pub const ENV_PIXEL_LIMIT: &str = "UPSCALE_BOT_PIXEL_LIMIT";
pub const ENV_ESRGAN_ROOT: &str = "UPSCALE_BOT_ESRGAN_ROOT";
pub const ENV_WORKSPACE_ROOT: &str = "UPSCALE_BOT_WORKSPACE_ROOT";
pub const ENV_BIND: &str = "UPSCALE_BOT_BIND";
pub const ENV_MAX_UPLOAD_BYTES: &str = "UPSCALE_BOT_MAX_UPLOAD_BYTES";

/// Effective bot configuration after all layers were applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotSettings {
    pub command_prefix: String,
    pub bind: String,
    pub pixel_limit: u32,
    pub max_upload_bytes: u64,
    pub max_download_bytes: Option<u64>,
    pub lossless_quality: u8,
    pub lossy_quality: u8,
    pub lossy_passes: u8,
    pub esrgan_root: PathBuf,
    pub workspace_root: Option<PathBuf>,
    pub python_binary: String,
    pub magick_binary: String,
    pub optipng_binary: String,
    pub scripts_dir: PathBuf,
}

impl BotSettings {
    pub fn defaults_for(app_root: &Path) -> Self {
        let limits = PipelineLimits::default();
        Self {
            command_prefix: String::from("!"),
            bind: String::from("127.0.0.1:8788"),
            pixel_limit: limits.pixel_limit,
            max_upload_bytes: limits.max_upload_bytes,
            max_download_bytes: Some(50_000_000),
            lossless_quality: limits.lossless_quality,
            lossy_quality: limits.lossy_quality,
            lossy_passes: limits.lossy_passes,
            esrgan_root: app_root.join("ESRGAN"),
            workspace_root: None,
            python_binary: String::from("python"),
            magick_binary: String::from("magick"),
            optipng_binary: String::from("optipng"),
            scripts_dir: app_root.join("scripts"),
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.esrgan_root.join(ESRGAN_MODELS_DIR_NAME)
    }

    /// Staging directories live under the workspace root, or the ESRGAN
    /// checkout when no separate root is configured.
    pub fn workspace(&self) -> Workspace {
        Workspace::under_root(
            self.workspace_root
                .as_deref()
                .unwrap_or(self.esrgan_root.as_path()),
        )
    }

    pub fn pipeline_limits(&self) -> PipelineLimits {
        PipelineLimits {
            pixel_limit: self.pixel_limit,
            max_upload_bytes: self.max_upload_bytes,
            lossless_quality: self.lossless_quality,
            lossy_quality: self.lossy_quality,
            lossy_passes: self.lossy_passes,
        }
    }

    pub fn tool_adapter_config(&self) -> ToolAdapterConfig {
        ToolAdapterConfig {
            magick_binary: self.magick_binary.clone(),
            optipng_binary: self.optipng_binary.clone(),
            scripts_dir: self.scripts_dir.clone(),
            ..ToolAdapterConfig::default()
        }
    }

    pub fn apply(&mut self, overlay: &BotSettingsOverlay) {
        if let Some(v) = overlay.command_prefix.as_ref() {
            self.command_prefix = v.clone();
        }
        if let Some(v) = overlay.bind.as_ref() {
            self.bind = v.clone();
        }
        if let Some(v) = overlay.pixel_limit {
            self.pixel_limit = v;
        }
        if let Some(v) = overlay.max_upload_bytes {
            self.max_upload_bytes = v;
        }
        if let Some(v) = overlay.max_download_bytes {
            self.max_download_bytes = Some(v);
        }
        if let Some(v) = overlay.lossless_quality {
            self.lossless_quality = v;
        }
        if let Some(v) = overlay.lossy_quality {
            self.lossy_quality = v;
        }
        if let Some(v) = overlay.lossy_passes {
            self.lossy_passes = v;
        }
        if let Some(v) = overlay.esrgan_root.as_ref() {
            self.esrgan_root = v.clone();
        }
        if let Some(v) = overlay.workspace_root.as_ref() {
            self.workspace_root = Some(v.clone());
        }
        if let Some(v) = overlay.python_binary.as_ref() {
            self.python_binary = v.clone();
        }
        if let Some(v) = overlay.magick_binary.as_ref() {
            self.magick_binary = v.clone();
        }
        if let Some(v) = overlay.optipng_binary.as_ref() {
            self.optipng_binary = v.clone();
        }
        if let Some(v) = overlay.scripts_dir.as_ref() {
            self.scripts_dir = v.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BotSettingsOverlay {
    pub command_prefix: Option<String>,
    pub bind: Option<String>,
    pub pixel_limit: Option<u32>,
    pub max_upload_bytes: Option<u64>,
    pub max_download_bytes: Option<u64>,
    pub lossless_quality: Option<u8>,
    pub lossy_quality: Option<u8>,
    pub lossy_passes: Option<u8>,
    pub esrgan_root: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub python_binary: Option<String>,
    pub magick_binary: Option<String>,
    pub optipng_binary: Option<String>,
    pub scripts_dir: Option<PathBuf>,
}

/// Defaults, then the settings file, then environment overrides.
pub fn load_bot_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<BotSettings, SettingsError> {
    let mut settings = BotSettings::defaults_for(app_root);
    settings.apply(&load_file_overlay(app_root, explicit_path)?);
    settings.apply(&env_overlay(|key| std::env::var(key).ok())?);
    validate_bot_settings(&settings)?;
    Ok(settings)
}

pub fn load_file_overlay(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<BotSettingsOverlay, SettingsError> {
    let explicit = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) });
    let (path, required) = match explicit {
        Some(path) => (path, true),
        None => (app_root.join(DEFAULT_SETTINGS_RELATIVE_PATH), false),
    };
    if !path.exists() {
        if required {
            return Err(SettingsError::ReadFile {
                path: path.display().to_string(),
                message: String::from("file does not exist"),
            });
        }
        return Ok(BotSettingsOverlay::default());
    }

    let raw = fs::read_to_string(path.as_path()).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let value = match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "json" => serde_json::from_str::<Value>(raw.as_str()).map_err(
            |error| SettingsError::ParseJson {
                path: path.display().to_string(),
                message: error.to_string(),
            },
        )?,
        _ => {
            let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
                SettingsError::ParseToml {
                    path: path.display().to_string(),
                    message: error.to_string(),
                }
            })?;
            serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
                path: path.display().to_string(),
                message: error.to_string(),
            })?
        }
    };
    let mut overlay = parse_settings_overlay_json(&value)?;
    let base = path.parent().unwrap_or(app_root);
    for dir in [
        &mut overlay.esrgan_root,
        &mut overlay.workspace_root,
        &mut overlay.scripts_dir,
    ] {
        if let Some(p) = dir.as_mut() {
            if p.is_relative() {
                *p = base.join(p.as_path());
            }
        }
    }
    Ok(overlay)
}

/// Settings file layout:
///
/// ```toml
/// [bot]
/// command_prefix = "!"
/// bind = "127.0.0.1:8788"
///
/// [limits]
/// pixel_limit = 1000
/// max_upload_bytes = 8000000
///
/// [esrgan]
/// root = "/opt/ESRGAN"
/// python_binary = "python3"
///
/// [tools]
/// magick_binary = "magick"
/// ```
pub fn parse_settings_overlay_json(value: &Value) -> Result<BotSettingsOverlay, SettingsError> {
    let root = value.as_object().ok_or(SettingsError::RootMustBeObject)?;
    let mut out = BotSettingsOverlay::default();

    if let Some(bot) = section(root, "bot")? {
        if let Some(v) = bot.get("command_prefix") {
            out.command_prefix = Some(parse_string(v, "bot.command_prefix")?);
        }
        if let Some(v) = bot.get("bind") {
            out.bind = Some(parse_string(v, "bot.bind")?);
        }
    }
    if let Some(limits) = section(root, "limits")? {
        if let Some(v) = limits.get("pixel_limit") {
            out.pixel_limit = Some(parse_uint(v, "limits.pixel_limit")?);
        }
        if let Some(v) = limits.get("max_upload_bytes") {
            out.max_upload_bytes = Some(parse_uint(v, "limits.max_upload_bytes")?);
        }
        if let Some(v) = limits.get("max_download_bytes") {
            out.max_download_bytes = Some(parse_uint(v, "limits.max_download_bytes")?);
        }
        if let Some(v) = limits.get("lossless_quality") {
            out.lossless_quality = Some(parse_uint(v, "limits.lossless_quality")?);
        }
        if let Some(v) = limits.get("lossy_quality") {
            out.lossy_quality = Some(parse_uint(v, "limits.lossy_quality")?);
        }
        if let Some(v) = limits.get("lossy_passes") {
            out.lossy_passes = Some(parse_uint(v, "limits.lossy_passes")?);
        }
    }
    if let Some(esrgan) = section(root, "esrgan")? {
        if let Some(v) = esrgan.get("root") {
            out.esrgan_root = Some(PathBuf::from(parse_string(v, "esrgan.root")?));
        }
        if let Some(v) = esrgan.get("workspace_root") {
            out.workspace_root = Some(PathBuf::from(parse_string(v, "esrgan.workspace_root")?));
        }
        if let Some(v) = esrgan.get("python_binary") {
            out.python_binary = Some(parse_string(v, "esrgan.python_binary")?);
        }
    }
    if let Some(tools) = section(root, "tools")? {
        if let Some(v) = tools.get("magick_binary") {
            out.magick_binary = Some(parse_string(v, "tools.magick_binary")?);
        }
        if let Some(v) = tools.get("optipng_binary") {
            out.optipng_binary = Some(parse_string(v, "tools.optipng_binary")?);
        }
        if let Some(v) = tools.get("scripts_dir") {
            out.scripts_dir = Some(PathBuf::from(parse_string(v, "tools.scripts_dir")?));
        }
    }
    Ok(out)
}

/// Reads overrides through `lookup` so tests never touch the process environment.
pub fn env_overlay<F>(lookup: F) -> Result<BotSettingsOverlay, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let mut out = BotSettingsOverlay {
        command_prefix: get(ENV_PREFIX),
        bind: get(ENV_BIND),
        esrgan_root: get(ENV_ESRGAN_ROOT).map(PathBuf::from),
        workspace_root: get(ENV_WORKSPACE_ROOT).map(PathBuf::from),
        ..BotSettingsOverlay::default()
    };
    if let Some(raw) = get(ENV_PIXEL_LIMIT) {
        out.pixel_limit = Some(parse_env_number(ENV_PIXEL_LIMIT, raw.as_str())?);
    }
    if let Some(raw) = get(ENV_MAX_UPLOAD_BYTES) {
        out.max_upload_bytes = Some(parse_env_number(ENV_MAX_UPLOAD_BYTES, raw.as_str())?);
    }
    Ok(out)
}

pub fn validate_bot_settings(settings: &BotSettings) -> Result<(), SettingsError> {
    if settings.command_prefix.trim().is_empty() {
        return Err(SettingsError::Invalid {
            field: String::from("command_prefix"),
            message: String::from("must not be empty"),
        });
    }
    if settings.pixel_limit == 0 {
        return Err(SettingsError::Invalid {
            field: String::from("pixel_limit"),
            message: String::from("must be greater than zero"),
        });
    }
    if settings.max_upload_bytes == 0 {
        return Err(SettingsError::Invalid {
            field: String::from("max_upload_bytes"),
            message: String::from("must be greater than zero"),
        });
    }
    for (field, quality) in [
        ("lossless_quality", settings.lossless_quality),
        ("lossy_quality", settings.lossy_quality),
    ] {
        if quality > 100 {
            return Err(SettingsError::Invalid {
                field: field.to_string(),
                message: String::from("must be between 0 and 100"),
            });
        }
    }
    Ok(())
}

fn section<'a>(
    root: &'a serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<&'a serde_json::Map<String, Value>>, SettingsError> {
    match root.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_object()
            .map(Some)
            .ok_or_else(|| SettingsError::InvalidFieldType {
                field: name.to_string(),
            }),
    }
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_uint<T>(value: &Value, field: &str) -> Result<T, SettingsError>
where
    T: TryFrom<u64>,
{
    value
        .as_u64()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| SettingsError::InvalidFieldType {
            field: field.to_string(),
        })
}

fn parse_env_number<T>(key: &str, raw: &str) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
{
    raw.parse::<T>().map_err(|_| SettingsError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read bot settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse bot settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse bot settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("bot settings root must be a table")]
    RootMustBeObject,
    #[error("bot settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("bot setting '{field}' {message}")]
    Invalid { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_root;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_upload_and_split_limits() {
        let settings = BotSettings::defaults_for(Path::new("/srv/bot"));

        assert_eq!(settings.command_prefix, "!");
        assert_eq!(settings.pixel_limit, 1000);
        assert_eq!(settings.max_upload_bytes, 8_000_000);
        assert_eq!(settings.model_dir(), PathBuf::from("/srv/bot/ESRGAN/models"));
        assert_eq!(
            settings.workspace().input_dir(),
            Path::new("/srv/bot/ESRGAN/LR")
        );
        assert_eq!(settings.pipeline_limits(), PipelineLimits::default());
    }

    #[test]
    fn parses_sectioned_overlay() {
        let overlay = parse_settings_overlay_json(&serde_json::json!({
            "bot": { "command_prefix": "?", "bind": "0.0.0.0:9000" },
            "limits": { "pixel_limit": 512, "lossy_passes": 6 },
            "esrgan": { "root": "/opt/esrgan", "python_binary": "python3" },
            "tools": { "magick_binary": "/usr/local/bin/magick" }
        }))
        .expect("overlay should parse");

        assert_eq!(overlay.command_prefix.as_deref(), Some("?"));
        assert_eq!(overlay.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(overlay.pixel_limit, Some(512));
        assert_eq!(overlay.lossy_passes, Some(6));
        assert_eq!(overlay.esrgan_root, Some(PathBuf::from("/opt/esrgan")));
        assert_eq!(overlay.python_binary.as_deref(), Some("python3"));
        assert_eq!(overlay.magick_binary.as_deref(), Some("/usr/local/bin/magick"));
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        let err = parse_settings_overlay_json(&serde_json::json!({
            "limits": { "lossy_quality": 300 }
        }))
        .expect_err("u8 overflow should fail");

        assert_eq!(
            err,
            SettingsError::InvalidFieldType {
                field: String::from("limits.lossy_quality")
            }
        );
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        let root = temp_root("settings_layers");
        fs::create_dir_all(root.join("config")).expect("config dir");
        fs::write(
            root.join(DEFAULT_SETTINGS_RELATIVE_PATH),
            r#"[bot]
command_prefix = "?"

[limits]
pixel_limit = 800

[esrgan]
root = "esrgan"
"#,
        )
        .expect("settings write");

        let mut settings = BotSettings::defaults_for(root.as_path());
        settings.apply(&load_file_overlay(root.as_path(), None).expect("file overlay"));
        let env = HashMap::from([
            (ENV_PIXEL_LIMIT, String::from("1200")),
            (ENV_WORKSPACE_ROOT, String::from("/tmp/stage")),
        ]);
        settings.apply(&env_overlay(|key| env.get(key).cloned()).expect("env overlay"));

        assert_eq!(settings.command_prefix, "?");
        assert_eq!(settings.pixel_limit, 1200);
        assert_eq!(settings.esrgan_root, root.join("config/esrgan"));
        assert_eq!(settings.workspace().output_dir(), Path::new("/tmp/stage/results"));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn explicit_json_settings_path_must_exist() {
        let root = temp_root("settings_explicit");
        fs::write(
            root.join("bot.json"),
            r#"{"bot":{"command_prefix":"$"}}"#,
        )
        .expect("json write");

        let overlay =
            load_file_overlay(root.as_path(), Some("bot.json")).expect("json overlay loads");
        assert_eq!(overlay.command_prefix.as_deref(), Some("$"));

        let err = load_file_overlay(root.as_path(), Some("missing.toml"))
            .expect_err("missing explicit file should fail");
        assert!(matches!(err, SettingsError::ReadFile { .. }));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn invalid_env_number_is_reported() {
        let err = env_overlay(|key| (key == ENV_PIXEL_LIMIT).then(|| String::from("lots")))
            .expect_err("non-numeric pixel limit should fail");

        assert_eq!(
            err,
            SettingsError::InvalidEnv {
                key: String::from(ENV_PIXEL_LIMIT),
                value: String::from("lots"),
            }
        );
    }

    #[test]
    fn validation_rejects_empty_prefix() {
        let mut settings = BotSettings::defaults_for(Path::new("/srv/bot"));
        settings.command_prefix = String::from(" ");

        assert!(matches!(
            validate_bot_settings(&settings),
            Err(SettingsError::Invalid { .. })
        ));
    }
}
