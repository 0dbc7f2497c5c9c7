pub(crate) mod file_ops;
pub(crate) mod pathing;
mod tool_config;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::pipeline::runtime::{
    CommandOutput, CommandSpec, PipelineCommandRunner, PipelineRuntimeError,
    TokioPipelineCommandRunner,
};
use crate::storage::list_files_sorted;

use file_ops::{
    is_file, remove_dir_if_exists, remove_file_if_exists, remove_new_files, snapshot_files,
};
use pathing::{file_name_of, has_extension, parent_of, sibling_with_extension, stem_of};
pub use tool_config::ToolAdapterConfig;

pub const CANONICAL_FORMAT: &str = "png";
pub const WEBP_FORMAT: &str = "webp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Convert,
    Resize,
    Split,
    Merge,
    Montage,
    Optimize,
    WebpLossless,
    WebpLossy,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Resize => "resize",
            Self::Split => "split",
            Self::Merge => "merge",
            Self::Montage => "montage",
            Self::Optimize => "optimize",
            Self::WebpLossless => "webp_lossless",
            Self::WebpLossy => "webp_lossy",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub input: PathBuf,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResizeRequest {
    pub image: PathBuf,
    pub factor: f64,
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRequest {
    pub input_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub stem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MontageRequest {
    pub original: PathBuf,
    pub result: PathBuf,
    pub original_label: String,
    pub result_label: String,
    pub output_dir: PathBuf,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeRequest {
    pub image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebpEncodeRequest {
    pub image: PathBuf,
    pub quality: u8,
    pub target_size: u64,
    pub passes: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    Convert(ConvertRequest),
    Resize(ResizeRequest),
    Split(SplitRequest),
    Merge(MergeRequest),
    Montage(MontageRequest),
    Optimize(OptimizeRequest),
    WebpLossless(WebpEncodeRequest),
    WebpLossy(WebpEncodeRequest),
}

impl ToolRequest {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Convert(_) => ToolKind::Convert,
            Self::Resize(_) => ToolKind::Resize,
            Self::Split(_) => ToolKind::Split,
            Self::Merge(_) => ToolKind::Merge,
            Self::Montage(_) => ToolKind::Montage,
            Self::Optimize(_) => ToolKind::Optimize,
            Self::WebpLossless(_) => ToolKind::WebpLossless,
            Self::WebpLossy(_) => ToolKind::WebpLossy,
        }
    }
}

/// Files a tool invocation left behind for the next stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolArtifacts {
    pub kind: ToolKind,
    pub paths: Vec<PathBuf>,
}

impl ToolArtifacts {
    pub fn primary(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }
}

#[async_trait]
pub trait PipelineToolAdapterOps: Send + Sync + 'static {
    async fn invoke(&self, request: &ToolRequest) -> Result<ToolArtifacts, ToolAdapterError>;
}

pub type SharedPipelineToolAdapterOps = Arc<dyn PipelineToolAdapterOps>;

/// ImageMagick, optipng and the tiling/montage helper scripts.
#[derive(Debug, Clone)]
pub struct MagickToolAdapters<R> {
    runner: R,
    config: ToolAdapterConfig,
}

impl<R> MagickToolAdapters<R>
where
    R: PipelineCommandRunner,
{
    pub fn new(config: ToolAdapterConfig, runner: R) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &ToolAdapterConfig {
        &self.config
    }

    pub fn build_convert_command(&self, input: &Path, staged_output: &Path) -> CommandSpec {
        CommandSpec::new(self.config.magick_binary.as_str(), parent_of(input))
            .path_arg(input)
            .path_arg(staged_output)
    }

    pub fn build_resize_command(&self, request: &ResizeRequest) -> CommandSpec {
        CommandSpec::new(self.config.magick_binary.as_str(), parent_of(&request.image))
            .arg("mogrify")
            .arg("-filter")
            .arg(request.filter.as_str())
            .arg("-resize")
            .arg(resize_percentage(request.factor))
            .arg("-format")
            .arg(CANONICAL_FORMAT)
            .path_arg(&request.image)
    }

    pub fn build_split_command(
        &self,
        request: &SplitRequest,
    ) -> Result<CommandSpec, ToolAdapterError> {
        let script = self.script(ToolKind::Split, self.config.split_script.as_str())?;
        Ok(CommandSpec::new(script, self.config.scripts_dir.clone()).path_arg(&request.input_dir))
    }

    pub fn build_merge_command(
        &self,
        request: &MergeRequest,
    ) -> Result<CommandSpec, ToolAdapterError> {
        let script = self.script(ToolKind::Merge, self.config.merge_script.as_str())?;
        Ok(CommandSpec::new(script, self.config.scripts_dir.clone())
            .path_arg(&request.input_dir)
            .path_arg(&request.output_dir)
            .arg(request.stem.as_str()))
    }

    pub fn build_montage_command(
        &self,
        request: &MontageRequest,
    ) -> Result<CommandSpec, ToolAdapterError> {
        let script = self.script(ToolKind::Montage, self.config.montage_script.as_str())?;
        let font = self.config.script_path(self.config.montage_font.as_str());
        Ok(CommandSpec::new(script, self.config.scripts_dir.clone())
            .arg(format!("-if={}", request.original.display()))
            .arg(format!("-is={}", request.result.display()))
            .arg(format!("-tf={}", request.original_label))
            .arg(format!("-ts={}", request.result_label))
            .arg("-td=2x1")
            .arg("-ug=100%")
            .arg(format!("-io={}", request.output_name))
            .arg(format!("-of={}", request.output_dir.display()))
            .arg(format!("-f={}", font.display())))
    }

    pub fn build_optimize_command(&self, request: &OptimizeRequest) -> CommandSpec {
        CommandSpec::new(self.config.optipng_binary.as_str(), parent_of(&request.image))
            .arg("-quiet")
            .arg(format!("-o{}", self.config.optipng_level))
            .path_arg(&request.image)
    }

    pub fn build_webp_command(
        &self,
        request: &WebpEncodeRequest,
        lossless: bool,
        output: &Path,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(self.config.magick_binary.as_str(), parent_of(&request.image))
            .path_arg(&request.image)
            .arg("-quality")
            .arg(request.quality.to_string())
            .arg("-define")
            .arg(format!("webp:lossless={lossless}"))
            .arg("-define")
            .arg(format!("webp:target-size={}", request.target_size));
        if let Some(passes) = request.passes {
            spec = spec.arg("-define").arg(format!("webp:pass={passes}"));
        }
        spec.path_arg(output)
    }

    async fn convert(&self, request: &ConvertRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let kind = ToolKind::Convert;
        let dir = parent_of(&request.input);
        let target_name = format!("{}.{}", stem_of(&request.input), request.format);
        let staging = dir.join(self.config.staging_dir_name.as_str());
        let staged = staging.join(target_name.as_str());
        let target = dir.join(target_name.as_str());

        fs::create_dir_all(staging.as_path())
            .await
            .map_err(|source| ToolAdapterError::Io { kind, source })?;
        let spec = self.build_convert_command(&request.input, staged.as_path());
        let outcome = match self.run_checked(kind, &spec).await {
            Ok(_) => {
                if is_file(staged.as_path()).await {
                    promote_staged(&request.input, staged.as_path(), target.as_path())
                        .await
                        .map_err(|source| ToolAdapterError::Io { kind, source })
                } else {
                    Err(ToolAdapterError::MissingArtifact {
                        kind,
                        path: staged.clone(),
                    })
                }
            }
            Err(error) => Err(error),
        };
        cleanup(kind, remove_dir_if_exists(staging.as_path()).await);
        outcome.map(|()| vec![target])
    }

    async fn resize(&self, request: &ResizeRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let kind = ToolKind::Resize;
        let spec = self.build_resize_command(request);
        self.run_checked(kind, &spec).await?;
        let resized = if has_extension(&request.image, CANONICAL_FORMAT) {
            request.image.clone()
        } else {
            sibling_with_extension(&request.image, CANONICAL_FORMAT)
        };
        if !is_file(resized.as_path()).await {
            return Err(ToolAdapterError::MissingArtifact {
                kind,
                path: resized,
            });
        }
        Ok(vec![resized])
    }

    async fn split(&self, request: &SplitRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let kind = ToolKind::Split;
        let spec = self.build_split_command(request)?;
        let before = snapshot_files(&request.input_dir)
            .await
            .map_err(|source| ToolAdapterError::Io { kind, source })?;
        if let Err(error) = self.run_checked(kind, &spec).await {
            cleanup(kind, remove_new_files(&request.input_dir, &before).await);
            return Err(error);
        }
        list_files_sorted(&request.input_dir)
            .await
            .map_err(|source| ToolAdapterError::Io { kind, source })
    }

    async fn merge(&self, request: &MergeRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let kind = ToolKind::Merge;
        let spec = self.build_merge_command(request)?;
        let before = snapshot_files(&request.output_dir)
            .await
            .map_err(|source| ToolAdapterError::Io { kind, source })?;
        if let Err(error) = self.run_checked(kind, &spec).await {
            cleanup(kind, remove_new_files(&request.output_dir, &before).await);
            return Err(error);
        }
        let merged = list_files_sorted(&request.output_dir)
            .await
            .map_err(|source| ToolAdapterError::Io { kind, source })?
            .into_iter()
            .filter(|path| file_name_of(path).starts_with(request.stem.as_str()))
            .collect::<Vec<_>>();
        if merged.is_empty() {
            return Err(ToolAdapterError::MissingArtifact {
                kind,
                path: request.output_dir.join(request.stem.as_str()),
            });
        }
        Ok(merged)
    }

    async fn montage(&self, request: &MontageRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let kind = ToolKind::Montage;
        let spec = self.build_montage_command(request)?;
        let output = request.output_dir.join(request.output_name.as_str());
        let result = self.run_checked(kind, &spec).await;
        if result.is_err() || !is_file(output.as_path()).await {
            cleanup(kind, remove_file_if_exists(output.as_path()).await);
            return match result {
                Err(error) => Err(error),
                Ok(_) => Err(ToolAdapterError::MissingArtifact { kind, path: output }),
            };
        }
        Ok(vec![output])
    }

    async fn optimize(&self, request: &OptimizeRequest) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let spec = self.build_optimize_command(request);
        self.run_checked(ToolKind::Optimize, &spec).await?;
        Ok(vec![request.image.clone()])
    }

    async fn webp(
        &self,
        kind: ToolKind,
        request: &WebpEncodeRequest,
        lossless: bool,
    ) -> Result<Vec<PathBuf>, ToolAdapterError> {
        let target = sibling_with_extension(&request.image, WEBP_FORMAT);
        let in_place = target == request.image;
        let output = if in_place {
            parent_of(&request.image).join(format!("{}.reencode.{WEBP_FORMAT}", stem_of(&request.image)))
        } else {
            target.clone()
        };

        let spec = self.build_webp_command(request, lossless, output.as_path());
        let result = self.run_checked(kind, &spec).await;
        if result.is_err() || !is_file(output.as_path()).await {
            cleanup(kind, remove_file_if_exists(output.as_path()).await);
            return match result {
                Err(error) => Err(error),
                Ok(_) => Err(ToolAdapterError::MissingArtifact { kind, path: output }),
            };
        }

        if in_place {
            fs::rename(output.as_path(), target.as_path())
                .await
                .map_err(|source| ToolAdapterError::Io { kind, source })?;
        } else {
            remove_file_if_exists(&request.image)
                .await
                .map_err(|source| ToolAdapterError::Io { kind, source })?;
        }
        Ok(vec![target])
    }

    fn script(&self, kind: ToolKind, name: &str) -> Result<String, ToolAdapterError> {
        let path = self.config.script_path(name);
        if !path.is_file() {
            return Err(ToolAdapterError::ScriptNotFound { kind, path });
        }
        Ok(path.to_string_lossy().to_string())
    }

    async fn run_checked(
        &self,
        kind: ToolKind,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, ToolAdapterError> {
        debug!(tool = %kind, command = %spec.display(), "running image tool");
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|source| ToolAdapterError::CommandRunner { kind, source })?;
        if !output.succeeded() {
            return Err(ToolAdapterError::CommandFailed {
                kind,
                program: spec.program.clone(),
                status_code: output.status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl<R> PipelineToolAdapterOps for MagickToolAdapters<R>
where
    R: PipelineCommandRunner,
{
    async fn invoke(&self, request: &ToolRequest) -> Result<ToolArtifacts, ToolAdapterError> {
        let kind = request.kind();
        let paths = match request {
            ToolRequest::Convert(r) => self.convert(r).await?,
            ToolRequest::Resize(r) => self.resize(r).await?,
            ToolRequest::Split(r) => self.split(r).await?,
            ToolRequest::Merge(r) => self.merge(r).await?,
            ToolRequest::Montage(r) => self.montage(r).await?,
            ToolRequest::Optimize(r) => self.optimize(r).await?,
            ToolRequest::WebpLossless(r) => self.webp(kind, r, true).await?,
            ToolRequest::WebpLossy(r) => self.webp(kind, r, false).await?,
        };
        Ok(ToolArtifacts { kind, paths })
    }
}

async fn promote_staged(original: &Path, staged: &Path, target: &Path) -> std::io::Result<()> {
    remove_file_if_exists(original).await?;
    fs::rename(staged, target).await
}

fn cleanup<T>(kind: ToolKind, result: std::io::Result<T>) {
    if let Err(error) = result {
        warn!(tool = %kind, error = %error, "failed to clean up partial tool output");
    }
}

/// `mogrify -resize` percentage for a downscale factor, e.g. `4` -> `25%`
/// and `3` -> `33.3333%`. At most four decimals, trailing zeros dropped.
pub fn resize_percentage(factor: f64) -> String {
    let fixed = format!("{:.4}", 100.0 / factor);
    let trimmed = if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.')
    } else {
        fixed.as_str()
    };
    format!("{trimmed}%")
}

#[derive(Debug, Error)]
pub enum ToolAdapterError {
    #[error("{kind} helper script not found: {}", path.display())]
    ScriptNotFound { kind: ToolKind, path: PathBuf },
    #[error("{kind} command could not run: {source}")]
    CommandRunner {
        kind: ToolKind,
        #[source]
        source: PipelineRuntimeError,
    },
    #[error("{kind} command failed ({program}) with exit code {status_code}: {stderr}")]
    CommandFailed {
        kind: ToolKind,
        program: String,
        status_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("{kind} produced no output at {}", path.display())]
    MissingArtifact { kind: ToolKind, path: PathBuf },
    #[error("{kind} filesystem error: {source}")]
    Io {
        kind: ToolKind,
        #[source]
        source: std::io::Error,
    },
}

impl ToolAdapterError {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::ScriptNotFound { kind, .. }
            | Self::CommandRunner { kind, .. }
            | Self::CommandFailed { kind, .. }
            | Self::MissingArtifact { kind, .. }
            | Self::Io { kind, .. } => *kind,
        }
    }
}

pub fn default_magick_tool_adapters(
    config: ToolAdapterConfig,
) -> MagickToolAdapters<TokioPipelineCommandRunner> {
    MagickToolAdapters::new(config, TokioPipelineCommandRunner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_root;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type RunHook = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

    #[derive(Clone, Default)]
    struct FakeRunner {
        seen: Arc<Mutex<Vec<CommandSpec>>>,
        next: Arc<Mutex<VecDeque<CommandOutput>>>,
        hook: Option<RunHook>,
    }

    impl FakeRunner {
        fn with_hook(hook: impl Fn(&CommandSpec) + Send + Sync + 'static) -> Self {
            Self {
                hook: Some(Arc::new(hook)),
                ..Self::default()
            }
        }

        fn failing_next(self, status_code: i32, stderr: &str) -> Self {
            self.next
                .lock()
                .expect("fake runner mutex poisoned")
                .push_back(CommandOutput {
                    status_code,
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                });
            self
        }

        fn take_seen(&self) -> Vec<CommandSpec> {
            std::mem::take(&mut *self.seen.lock().expect("fake runner mutex poisoned"))
        }
    }

    #[async_trait]
    impl PipelineCommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError> {
            self.seen
                .lock()
                .expect("fake runner mutex poisoned")
                .push(spec.clone());
            if let Some(hook) = self.hook.as_ref() {
                hook(spec);
            }
            Ok(self
                .next
                .lock()
                .expect("fake runner mutex poisoned")
                .pop_front()
                .unwrap_or(CommandOutput {
                    status_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }))
        }
    }

    fn write_last_arg(spec: &CommandSpec, bytes: &[u8]) {
        if let Some(last) = spec.args.last() {
            std::fs::write(last, bytes).expect("fake tool output should be written");
        }
    }

    fn config_with_scripts(root: &Path) -> ToolAdapterConfig {
        let scripts = root.join("scripts");
        std::fs::create_dir_all(scripts.as_path()).expect("scripts dir should exist");
        for name in ["split.sh", "merge.sh", "montage.sh"] {
            std::fs::write(scripts.join(name), b"#!/bin/sh\n").expect("script should exist");
        }
        ToolAdapterConfig {
            scripts_dir: scripts,
            ..ToolAdapterConfig::default()
        }
    }

    #[test]
    fn resize_percentage_matches_downscale_factor() {
        assert_eq!(resize_percentage(4.0), "25%");
        assert_eq!(resize_percentage(2.0), "50%");
        assert_eq!(resize_percentage(0.5), "200%");
        assert_eq!(resize_percentage(3.0), "33.3333%");
        assert_eq!(resize_percentage(1.5), "66.6667%");
        assert_eq!(resize_percentage(8.0), "12.5%");
    }

    #[test]
    fn builds_resize_command_as_argument_vector() {
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), FakeRunner::default());
        let cmd = adapters.build_resize_command(&ResizeRequest {
            image: PathBuf::from("/w/LR/cat; rm -rf.png"),
            factor: 4.0,
            filter: String::from("point"),
        });

        assert_eq!(cmd.program, "magick");
        assert_eq!(
            cmd.args,
            vec![
                "mogrify",
                "-filter",
                "point",
                "-resize",
                "25%",
                "-format",
                "png",
                "/w/LR/cat; rm -rf.png",
            ]
        );
    }

    #[test]
    fn builds_lossy_webp_command_with_passes() {
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), FakeRunner::default());
        let cmd = adapters.build_webp_command(
            &WebpEncodeRequest {
                image: PathBuf::from("/w/results/cat_rlt.png"),
                quality: 75,
                target_size: 8_000_000,
                passes: Some(4),
            },
            false,
            Path::new("/w/results/cat_rlt.webp"),
        );

        assert!(cmd
            .args
            .windows(2)
            .any(|w| w[0] == "-define" && w[1] == "webp:lossless=false"));
        assert!(cmd
            .args
            .windows(2)
            .any(|w| w[0] == "-define" && w[1] == "webp:target-size=8000000"));
        assert!(cmd
            .args
            .windows(2)
            .any(|w| w[0] == "-define" && w[1] == "webp:pass=4"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("/w/results/cat_rlt.webp"));
    }

    #[test]
    fn script_commands_fail_when_helper_script_is_missing() {
        let root = temp_root("tools_missing_script");
        let adapters = MagickToolAdapters::new(
            ToolAdapterConfig {
                scripts_dir: root.join("scripts"),
                ..ToolAdapterConfig::default()
            },
            FakeRunner::default(),
        );

        let err = adapters
            .build_split_command(&SplitRequest {
                input_dir: root.join("LR"),
            })
            .expect_err("missing split script should error");
        assert!(matches!(
            err,
            ToolAdapterError::ScriptNotFound {
                kind: ToolKind::Split,
                ..
            }
        ));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn montage_command_passes_labels_and_output_name() {
        let root = temp_root("tools_montage_cmd");
        let adapters = MagickToolAdapters::new(config_with_scripts(&root), FakeRunner::default());
        let cmd = adapters
            .build_montage_command(&MontageRequest {
                original: PathBuf::from("/w/LR/cat.png"),
                result: PathBuf::from("/w/results/cat_rlt.png"),
                original_label: String::from("LR"),
                result_label: String::from("4xBox"),
                output_dir: PathBuf::from("/w/results"),
                output_name: String::from("cat_montage.png"),
            })
            .expect("montage command should build");

        assert!(cmd.program.ends_with("montage.sh"));
        assert!(cmd.args.iter().any(|v| v == "-ts=4xBox"));
        assert!(cmd.args.iter().any(|v| v == "-io=cat_montage.png"));
        assert!(cmd.args.iter().any(|v| v == "-td=2x1"));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn convert_stages_output_and_replaces_original() {
        let root = temp_root("tools_convert");
        let lr = root.join("LR");
        std::fs::create_dir_all(lr.as_path()).expect("LR dir");
        std::fs::write(lr.join("cat.jpg"), b"jpeg").expect("input image");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"png"));
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner.clone());
        let artifacts = adapters
            .invoke(&ToolRequest::Convert(ConvertRequest {
                input: lr.join("cat.jpg"),
                format: String::from("png"),
            }))
            .await
            .expect("convert should succeed");

        assert_eq!(artifacts.primary(), Some(lr.join("cat.png").as_path()));
        assert!(lr.join("cat.png").is_file());
        assert!(!lr.join("cat.jpg").exists());
        assert!(!lr.join("_TMP").exists());
        let seen = runner.take_seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].args[1], lr.join("_TMP/cat.png").to_string_lossy());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn convert_failure_cleans_staging_dir_and_keeps_original() {
        let root = temp_root("tools_convert_fail");
        let lr = root.join("LR");
        std::fs::create_dir_all(lr.as_path()).expect("LR dir");
        std::fs::write(lr.join("cat.jpg"), b"jpeg").expect("input image");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"partial"))
            .failing_next(1, "convert: corrupt image");
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner);
        let err = adapters
            .invoke(&ToolRequest::Convert(ConvertRequest {
                input: lr.join("cat.jpg"),
                format: String::from("png"),
            }))
            .await
            .expect_err("non-zero exit should fail");

        assert_eq!(err.kind(), ToolKind::Convert);
        assert!(matches!(err, ToolAdapterError::CommandFailed { status_code: 1, .. }));
        assert!(!lr.join("_TMP").exists());
        assert!(!lr.join("cat.png").exists());
        assert!(lr.join("cat.jpg").is_file());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn split_failure_removes_partial_tiles() {
        let root = temp_root("tools_split_fail");
        let lr = root.join("LR");
        std::fs::create_dir_all(lr.as_path()).expect("LR dir");
        std::fs::write(lr.join("cat.png"), b"png").expect("input image");
        let tiles_dir = lr.clone();
        let runner = FakeRunner::with_hook(move |_spec| {
            std::fs::write(tiles_dir.join("cat_tile_00.png"), b"tile").expect("partial tile");
        })
        .failing_next(2, "split: out of memory");
        let adapters = MagickToolAdapters::new(config_with_scripts(&root), runner);

        let err = adapters
            .invoke(&ToolRequest::Split(SplitRequest {
                input_dir: lr.clone(),
            }))
            .await
            .expect_err("split should fail");

        assert_eq!(err.kind(), ToolKind::Split);
        assert!(lr.join("cat.png").is_file());
        assert!(!lr.join("cat_tile_00.png").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn merge_failure_removes_partial_result_and_keeps_earlier_files() {
        let root = temp_root("tools_merge_fail");
        let lr = root.join("LR");
        let results = root.join("results");
        std::fs::create_dir_all(lr.as_path()).expect("LR dir");
        std::fs::create_dir_all(results.as_path()).expect("results dir");
        std::fs::write(results.join("cat_tile_00_rlt.png"), b"tile").expect("upscaled tile");
        let partial_dir = results.clone();
        let runner = FakeRunner::with_hook(move |_spec| {
            std::fs::write(partial_dir.join("cat_rlt.png"), b"half").expect("partial merge");
        })
        .failing_next(1, "merge: missing tile");
        let adapters = MagickToolAdapters::new(config_with_scripts(&root), runner);

        let err = adapters
            .invoke(&ToolRequest::Merge(MergeRequest {
                input_dir: lr,
                output_dir: results.clone(),
                stem: String::from("cat"),
            }))
            .await
            .expect_err("merge should fail");

        assert_eq!(err.kind(), ToolKind::Merge);
        assert!(!results.join("cat_rlt.png").exists());
        assert!(results.join("cat_tile_00_rlt.png").is_file());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn montage_without_output_file_is_missing_artifact() {
        let root = temp_root("tools_montage_missing");
        let adapters = MagickToolAdapters::new(config_with_scripts(&root), FakeRunner::default());

        let err = adapters
            .invoke(&ToolRequest::Montage(MontageRequest {
                original: root.join("LR/cat.png"),
                result: root.join("results/cat_rlt.png"),
                original_label: String::from("LR"),
                result_label: String::from("4xBox"),
                output_dir: root.join("results"),
                output_name: String::from("cat_montage.png"),
            }))
            .await
            .expect_err("montage without output should fail");

        assert!(matches!(
            err,
            ToolAdapterError::MissingArtifact {
                kind: ToolKind::Montage,
                ..
            }
        ));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn webp_lossless_replaces_png_with_webp() {
        let root = temp_root("tools_webp_lossless");
        let png = root.join("cat_rlt.png");
        std::fs::write(png.as_path(), vec![0u8; 64]).expect("png output");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"webp"));
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner);
        let artifacts = adapters
            .invoke(&ToolRequest::WebpLossless(WebpEncodeRequest {
                image: png.clone(),
                quality: 50,
                target_size: 8_000_000,
                passes: None,
            }))
            .await
            .expect("lossless webp should succeed");

        assert_eq!(artifacts.paths, vec![root.join("cat_rlt.webp")]);
        assert!(!png.exists());
        assert!(root.join("cat_rlt.webp").is_file());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn webp_failure_keeps_source_raster() {
        let root = temp_root("tools_webp_fail");
        let png = root.join("cat_rlt.png");
        std::fs::write(png.as_path(), b"full result").expect("png output");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"partial"))
            .failing_next(1, "webp: encoding failed");
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner);
        let err = adapters
            .invoke(&ToolRequest::WebpLossless(WebpEncodeRequest {
                image: png.clone(),
                quality: 50,
                target_size: 8_000_000,
                passes: None,
            }))
            .await
            .expect_err("webp should fail");

        assert_eq!(err.kind(), ToolKind::WebpLossless);
        assert_eq!(std::fs::read(png.as_path()).expect("png"), b"full result");
        assert!(!root.join("cat_rlt.webp").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn failed_reencode_keeps_existing_webp() {
        let root = temp_root("tools_webp_reencode_fail");
        let webp = root.join("cat_rlt.webp");
        std::fs::write(webp.as_path(), b"lossless").expect("webp output");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"partial"))
            .failing_next(1, "webp: encoding failed");
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner);
        let err = adapters
            .invoke(&ToolRequest::WebpLossy(WebpEncodeRequest {
                image: webp.clone(),
                quality: 75,
                target_size: 8_000_000,
                passes: Some(4),
            }))
            .await
            .expect_err("lossy re-encode should fail");

        assert_eq!(err.kind(), ToolKind::WebpLossy);
        assert_eq!(std::fs::read(webp.as_path()).expect("webp"), b"lossless");
        assert!(!root.join("cat_rlt.reencode.webp").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn webp_lossy_reencodes_existing_webp_in_place() {
        let root = temp_root("tools_webp_lossy");
        let webp = root.join("cat_rlt.webp");
        std::fs::write(webp.as_path(), vec![0u8; 64]).expect("webp output");

        let runner = FakeRunner::with_hook(|spec| write_last_arg(spec, b"small"));
        let adapters = MagickToolAdapters::new(ToolAdapterConfig::default(), runner.clone());
        adapters
            .invoke(&ToolRequest::WebpLossy(WebpEncodeRequest {
                image: webp.clone(),
                quality: 75,
                target_size: 8_000_000,
                passes: Some(4),
            }))
            .await
            .expect("lossy webp should succeed");

        assert_eq!(std::fs::read(webp.as_path()).expect("webp"), b"small");
        assert!(!root.join("cat_rlt.reencode.webp").exists());
        let seen = runner.take_seen();
        assert_eq!(seen[0].args[0], webp.to_string_lossy());

        let _ = std::fs::remove_dir_all(root);
    }
}
