use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::pipeline::acquire::{HttpImageFetcher, SharedImageFetcher, TransferError};
use crate::pipeline::delivery::{
    DeliveryError, ReplyMessage, SharedReplyChannel, WebhookReplyChannel,
};
use crate::pipeline::executor::{
    default_esrgan_executor, ExecutorError, SharedUpscaleExecutor, UpscaleRequest,
};
use crate::pipeline::job::{image_extension, Job};
use crate::pipeline::tool_adapters::{
    default_magick_tool_adapters, ConvertRequest, MergeRequest, MontageRequest, OptimizeRequest,
    ResizeRequest, SharedPipelineToolAdapterOps, SplitRequest, ToolAdapterError, ToolArtifacts,
    ToolKind, ToolRequest, WebpEncodeRequest, CANONICAL_FORMAT,
};
use crate::pipeline::{PipelineStage, StagePlan};
use crate::settings_layer::BotSettings;
use crate::storage::Workspace;

pub const RESULT_SUFFIX: &str = "_rlt";
pub const MONTAGE_SUFFIX: &str = "_montage";
pub const ORIGINAL_MONTAGE_LABEL: &str = "LR";

/// Runs one job from download to reply. Implementations must not touch the
/// queue; the caller decides what happens next.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &mut Job) -> Result<JobOutcome, JobError>;
}

pub type SharedJobProcessor = Arc<dyn JobProcessor>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineLimits {
    /// Width or height at or above which the image is tiled before upscaling.
    pub pixel_limit: u32,
    /// Largest file the reply channel accepts.
    pub max_upload_bytes: u64,
    pub lossless_quality: u8,
    pub lossy_quality: u8,
    pub lossy_passes: u8,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            pixel_limit: 1000,
            max_upload_bytes: 8_000_000,
            lossless_quality: 50,
            lossy_quality: 75,
            lossy_passes: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Stages whose body actually ran, in order.
    pub stages: Vec<PipelineStage>,
    pub result: Option<PathBuf>,
    pub montage: Option<PathBuf>,
    pub delivered: bool,
}

#[derive(Clone)]
pub struct UpscalePipeline {
    workspace: Workspace,
    fetcher: SharedImageFetcher,
    tools: SharedPipelineToolAdapterOps,
    executor: SharedUpscaleExecutor,
    replies: SharedReplyChannel,
    limits: PipelineLimits,
}

impl UpscalePipeline {
    pub fn new(
        workspace: Workspace,
        fetcher: SharedImageFetcher,
        tools: SharedPipelineToolAdapterOps,
        executor: SharedUpscaleExecutor,
        replies: SharedReplyChannel,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            workspace,
            fetcher,
            tools,
            executor,
            replies,
            limits,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn limits(&self) -> PipelineLimits {
        self.limits
    }

    async fn acquire(&self, job: &Job) -> Result<(), JobError> {
        let destination = self.workspace.input_path(job.image.as_str());
        let bytes = self
            .fetcher
            .fetch(job.source.url(), destination.as_path())
            .await
            .map_err(JobError::Transfer)?;
        debug!(job_id = %job.id, bytes, image = %job.image, "source image staged");
        Ok(())
    }

    async fn normalize_format(&self, job: &mut Job) -> Result<(), JobError> {
        if image_extension(job.image.as_str()).as_deref() == Some(CANONICAL_FORMAT) {
            return Ok(());
        }
        let artifacts = self
            .invoke(ToolRequest::Convert(ConvertRequest {
                input: self.workspace.input_path(job.image.as_str()),
                format: String::from(CANONICAL_FORMAT),
            }))
            .await?;
        rename_job_image(job, &artifacts);
        Ok(())
    }

    async fn measure(&self, job: &mut Job) -> Result<(), JobError> {
        let path = self.workspace.input_path(job.image.as_str());
        let (width, height) = read_dimensions(path).await?;
        job.split = exceeds_pixel_limit(width, height, job.downscale, self.limits.pixel_limit);
        debug!(job_id = %job.id, width, height, split = job.split, "measured source image");
        Ok(())
    }

    async fn downscale(&self, job: &mut Job, factor: f64) -> Result<(), JobError> {
        let artifacts = self
            .invoke(ToolRequest::Resize(ResizeRequest {
                image: self.workspace.input_path(job.image.as_str()),
                factor,
                filter: job.filter.clone(),
            }))
            .await?;
        rename_job_image(job, &artifacts);
        Ok(())
    }

    async fn upscale(&self, job: &Job) -> Result<(), JobError> {
        let request = UpscaleRequest {
            input_dir: self.workspace.input_dir().to_path_buf(),
            output_dir: self.workspace.output_dir().to_path_buf(),
            model: job.model.clone(),
        };
        let outcome = self
            .executor
            .upscale(&request)
            .await
            .map_err(JobError::from_executor)?;
        debug!(job_id = %job.id, outputs = outcome.outputs.len(), "upscaler finished");
        Ok(())
    }

    async fn montage(&self, job: &Job) -> Result<(), JobError> {
        let stem = job.image_stem();
        self.invoke(ToolRequest::Montage(MontageRequest {
            original: self.workspace.input_path(job.image.as_str()),
            result: self
                .workspace
                .output_path(format!("{stem}{RESULT_SUFFIX}.{CANONICAL_FORMAT}").as_str()),
            original_label: String::from(ORIGINAL_MONTAGE_LABEL),
            result_label: job.model.label().to_string(),
            output_dir: self.workspace.output_dir().to_path_buf(),
            output_name: format!("{stem}{MONTAGE_SUFFIX}.{CANONICAL_FORMAT}"),
        }))
        .await?;
        Ok(())
    }

    /// Optimizes every PNG, then steps anything still at or above the upload
    /// ceiling down to lossless and finally lossy WebP.
    async fn encode(&self) -> Result<(), JobError> {
        for path in self.list_output().await? {
            if image_extension(file_name(&path).as_str()).as_deref() == Some(CANONICAL_FORMAT) {
                self.invoke(ToolRequest::Optimize(OptimizeRequest { image: path }))
                    .await?;
            }
        }

        for lossless in [true, false] {
            for path in self.list_output().await? {
                if file_size(&path).await? < self.limits.max_upload_bytes {
                    continue;
                }
                let request = self.webp_request(path.clone(), lossless);
                let artifacts = self
                    .invoke(if lossless {
                        ToolRequest::WebpLossless(request)
                    } else {
                        ToolRequest::WebpLossy(request)
                    })
                    .await?;
                self.discard_raster(&path, &artifacts).await?;
            }
        }
        Ok(())
    }

    fn webp_request(&self, image: PathBuf, lossless: bool) -> WebpEncodeRequest {
        WebpEncodeRequest {
            image,
            quality: if lossless {
                self.limits.lossless_quality
            } else {
                self.limits.lossy_quality
            },
            target_size: self.limits.max_upload_bytes,
            passes: (!lossless).then_some(self.limits.lossy_passes),
        }
    }

    async fn discard_raster(&self, source: &Path, artifacts: &ToolArtifacts) -> Result<(), JobError> {
        if artifacts.paths.iter().any(|path| path == source) {
            return Ok(());
        }
        match fs::remove_file(source).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(JobError::Workspace(error)),
        }
    }

    async fn locate_outputs(&self, job: &Job) -> Result<(Option<PathBuf>, Option<PathBuf>), JobError> {
        let stem = job.image_stem();
        let mut result = None;
        let mut montage = None;
        for path in self.list_output().await? {
            let name = file_name(&path);
            if name.contains(MONTAGE_SUFFIX) {
                montage.get_or_insert(path);
            } else if name.contains(stem) {
                result.get_or_insert(path);
            }
        }
        Ok((result, montage))
    }

    async fn deliver(
        &self,
        job: &Job,
        result: Option<&Path>,
        montage: Option<&Path>,
    ) -> Result<(), JobError> {
        let mut message =
            ReplyMessage::text(job.reply_to.addressed(&format!("Upscaled using {}", job.model)));
        match result {
            Some(path) => message = message.with_file(path),
            None => warn!(job_id = %job.id, "no result file found for delivery"),
        }
        self.replies
            .send(&job.reply_to, message)
            .await
            .map_err(JobError::Delivery)?;

        if job.wants_montage() {
            if let Some(path) = montage {
                let message = ReplyMessage::text(
                    job.reply_to.addressed("here is the montage you requested"),
                )
                .with_file(path);
                self.replies
                    .send(&job.reply_to, message)
                    .await
                    .map_err(JobError::Delivery)?;
            }
        }
        Ok(())
    }

    async fn invoke(&self, request: ToolRequest) -> Result<ToolArtifacts, JobError> {
        self.tools.invoke(&request).await.map_err(JobError::from_tool)
    }

    async fn list_output(&self) -> Result<Vec<PathBuf>, JobError> {
        self.workspace.list_output().await.map_err(JobError::Workspace)
    }

    async fn run_stage(&self, stage: PipelineStage, job: &mut Job) -> Result<(), JobError> {
        match stage {
            PipelineStage::Downscale => match job.downscale {
                Some(factor) => self.downscale(job, factor).await,
                None => Ok(()),
            },
            PipelineStage::Split => {
                self.invoke(ToolRequest::Split(SplitRequest {
                    input_dir: self.workspace.input_dir().to_path_buf(),
                }))
                .await
                .map(|_| ())
            }
            PipelineStage::Upscale => self.upscale(job).await,
            PipelineStage::Merge => {
                self.invoke(ToolRequest::Merge(MergeRequest {
                    input_dir: self.workspace.input_dir().to_path_buf(),
                    output_dir: self.workspace.output_dir().to_path_buf(),
                    stem: job.image_stem().to_string(),
                }))
                .await
                .map(|_| ())
            }
            PipelineStage::Montage => self.montage(job).await,
            PipelineStage::Encode => self.encode().await,
            PipelineStage::Acquire
            | PipelineStage::NormalizeFormat
            | PipelineStage::Measure
            | PipelineStage::Deliver => Ok(()),
        }
    }
}

#[async_trait]
impl JobProcessor for UpscalePipeline {
    async fn process(&self, job: &mut Job) -> Result<JobOutcome, JobError> {
        info!(job_id = %job.id, image = %job.image, model = %job.model, "processing job");

        // Dimensions decide whether the job is split, so the plan is only
        // known once the source has been fetched, normalized and measured.
        self.acquire(job).await?;
        self.normalize_format(job).await?;
        self.measure(job).await?;
        let plan = StagePlan::for_job(job);
        debug!(job_id = %job.id, stages = ?plan.labels(), "stage plan");

        let mut result = None;
        let mut montage = None;
        let mut delivered = false;
        for stage in plan.stages.iter().copied() {
            match stage {
                PipelineStage::Acquire | PipelineStage::NormalizeFormat | PipelineStage::Measure => {}
                PipelineStage::Deliver => {
                    (result, montage) = self.locate_outputs(job).await?;
                    delivered = match self.deliver(job, result.as_deref(), montage.as_deref()).await {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(job_id = %job.id, error = %error, "reply delivery failed");
                            false
                        }
                    };
                }
                other => self.run_stage(other, job).await?,
            }
        }

        info!(job_id = %job.id, delivered, "job finished");
        Ok(JobOutcome {
            stages: plan.stages,
            result,
            montage,
            delivered,
        })
    }
}

/// Both dimensions are divided by the downscale factor before comparing.
pub fn exceeds_pixel_limit(width: u32, height: u32, downscale: Option<f64>, limit: u32) -> bool {
    let factor = downscale.unwrap_or(1.0);
    let limit = f64::from(limit);
    f64::from(width) / factor >= limit || f64::from(height) / factor >= limit
}

async fn read_dimensions(path: PathBuf) -> Result<(u32, u32), JobError> {
    let shown = path.clone();
    tokio::task::spawn_blocking(move || image::image_dimensions(path.as_path()))
        .await
        .map_err(|error| JobError::Measure {
            path: shown.clone(),
            message: error.to_string(),
        })?
        .map_err(|error| JobError::Measure {
            path: shown,
            message: error.to_string(),
        })
}

async fn file_size(path: &Path) -> Result<u64, JobError> {
    fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .map_err(JobError::Workspace)
}

fn rename_job_image(job: &mut Job, artifacts: &ToolArtifacts) {
    if let Some(path) = artifacts.primary() {
        job.image = file_name(path);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn default_upscale_pipeline(settings: &BotSettings) -> Result<UpscalePipeline, TransferError> {
    let fetcher = HttpImageFetcher::new(settings.max_download_bytes)?;
    Ok(UpscalePipeline::new(
        settings.workspace(),
        Arc::new(fetcher),
        Arc::new(default_magick_tool_adapters(settings.tool_adapter_config())),
        Arc::new(default_esrgan_executor(
            settings.python_binary.as_str(),
            settings.esrgan_root.as_path(),
        )),
        Arc::new(WebhookReplyChannel::default()),
        settings.pipeline_limits(),
    ))
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not download the image: {0}")]
    Transfer(#[source] TransferError),
    #[error("could not convert the image: {0}")]
    Conversion(#[source] ToolAdapterError),
    #[error("could not read dimensions of {}: {message}", path.display())]
    Measure { path: PathBuf, message: String },
    #[error("could not downscale the image: {0}")]
    Resize(#[source] ToolAdapterError),
    #[error("could not split the image: {0}")]
    Split(#[source] ToolAdapterError),
    #[error("upscaling failed: {0}")]
    Execution(#[source] ExecutorError),
    #[error("upscaling produced no output in {}", .0.display())]
    NoOutput(PathBuf),
    #[error("could not merge the upscaled tiles: {0}")]
    Merge(#[source] ToolAdapterError),
    #[error("there was an error making your montage: {0}")]
    Montage(#[source] ToolAdapterError),
    #[error("could not shrink the result for upload: {0}")]
    Encode(#[source] ToolAdapterError),
    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("could not send the reply: {0}")]
    Delivery(#[source] DeliveryError),
}

impl JobError {
    pub fn from_tool(error: ToolAdapterError) -> Self {
        match error.kind() {
            ToolKind::Convert => Self::Conversion(error),
            ToolKind::Resize => Self::Resize(error),
            ToolKind::Split => Self::Split(error),
            ToolKind::Merge => Self::Merge(error),
            ToolKind::Montage => Self::Montage(error),
            ToolKind::Optimize | ToolKind::WebpLossless | ToolKind::WebpLossy => {
                Self::Encode(error)
            }
        }
    }

    pub fn from_executor(error: ExecutorError) -> Self {
        match error {
            ExecutorError::NoOutput(dir) => Self::NoOutput(dir),
            other => Self::Execution(other),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "transfer_error",
            Self::Conversion(_) => "conversion_error",
            Self::Measure { .. } => "measure_error",
            Self::Resize(_) => "resize_error",
            Self::Split(_) => "split_error",
            Self::Execution(_) => "execution_error",
            Self::NoOutput(_) => "no_output_error",
            Self::Merge(_) => "merge_error",
            Self::Montage(_) => "montage_error",
            Self::Encode(_) => "encode_error",
            Self::Workspace(_) => "workspace_error",
            Self::Delivery(_) => "delivery_error",
        }
    }
}
