use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::pipeline::job::ModelId;
use crate::pipeline::runtime::{
    CommandSpec, PipelineCommandRunner, PipelineRuntimeError, TokioPipelineCommandRunner,
};
use crate::pipeline::tool_adapters::file_ops::snapshot_files;
use crate::pipeline::tool_adapters::pathing::dir_arg;
use crate::storage::list_files_sorted;

pub const ESRGAN_SCRIPT_NAME: &str = "test.py";
pub const ESRGAN_MODELS_DIR_NAME: &str = "models";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleRequest {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model: ModelId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleOutcome {
    pub outputs: Vec<PathBuf>,
}

/// Runs the neural upscaler once over a whole staged directory.
#[async_trait]
pub trait UpscaleExecutor: Send + Sync + 'static {
    async fn upscale(&self, request: &UpscaleRequest) -> Result<UpscaleOutcome, ExecutorError>;
}

pub type SharedUpscaleExecutor = Arc<dyn UpscaleExecutor>;

#[derive(Debug, Clone)]
pub struct EsrganUpscaleExecutor<R> {
    runner: R,
    python_binary: String,
    esrgan_root: PathBuf,
}

impl<R> EsrganUpscaleExecutor<R>
where
    R: PipelineCommandRunner,
{
    pub fn new(runner: R, python_binary: impl Into<String>, esrgan_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            python_binary: python_binary.into(),
            esrgan_root: esrgan_root.into(),
        }
    }

    pub fn model_path(&self, model: &ModelId) -> PathBuf {
        self.esrgan_root
            .join(ESRGAN_MODELS_DIR_NAME)
            .join(model.as_str())
    }

    pub fn build_command(&self, request: &UpscaleRequest) -> CommandSpec {
        CommandSpec::new(self.python_binary.as_str(), self.esrgan_root.clone())
            .path_arg(self.esrgan_root.join(ESRGAN_SCRIPT_NAME).as_path())
            .path_arg(self.model_path(&request.model).as_path())
            .arg(format!("--input={}", dir_arg(&request.input_dir)))
            .arg(format!("--output={}", dir_arg(&request.output_dir)))
    }
}

#[async_trait]
impl<R> UpscaleExecutor for EsrganUpscaleExecutor<R>
where
    R: PipelineCommandRunner,
{
    async fn upscale(&self, request: &UpscaleRequest) -> Result<UpscaleOutcome, ExecutorError> {
        fs::create_dir_all(request.output_dir.as_path())
            .await
            .map_err(ExecutorError::Io)?;
        let before = snapshot_files(request.output_dir.as_path())
            .await
            .map_err(ExecutorError::Io)?;

        let spec = self.build_command(request);
        info!(model = %request.model, input = %request.input_dir.display(), "starting upscaler");
        let output = self.runner.run(&spec).await?;
        if !output.succeeded() {
            warn!(
                model = %request.model,
                status_code = output.status_code,
                stderr = %output.stderr.trim(),
                "upscaler exited with failure"
            );
            return Err(ExecutorError::Failed {
                status_code: output.status_code,
                stderr: output.stderr,
            });
        }

        // Files left over from an earlier run are not results of this one.
        let outputs: Vec<PathBuf> = list_files_sorted(request.output_dir.as_path())
            .await
            .map_err(ExecutorError::Io)?
            .into_iter()
            .filter(|path| !before.contains(path))
            .collect();
        if outputs.is_empty() {
            return Err(ExecutorError::NoOutput(request.output_dir.clone()));
        }
        Ok(UpscaleOutcome { outputs })
    }
}

pub fn default_esrgan_executor(
    python_binary: impl Into<String>,
    esrgan_root: impl AsRef<Path>,
) -> EsrganUpscaleExecutor<TokioPipelineCommandRunner> {
    EsrganUpscaleExecutor::new(
        TokioPipelineCommandRunner,
        python_binary,
        esrgan_root.as_ref().to_path_buf(),
    )
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Spawn(#[from] PipelineRuntimeError),
    #[error("upscaler exited with code {status_code}: {stderr}")]
    Failed { status_code: i32, stderr: String },
    #[error("upscaler exited cleanly but wrote nothing to {}", .0.display())]
    NoOutput(PathBuf),
    #[error("upscaler workspace error: {0}")]
    Io(#[source] std::io::Error),
}
