pub mod acquire;
pub mod delivery;
pub mod execution;
pub mod executor;
pub mod job;
pub mod runtime;
pub mod tool_adapters;

use crate::pipeline::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStage {
    Acquire,
    NormalizeFormat,
    Measure,
    Downscale,
    Split,
    Upscale,
    Merge,
    Montage,
    Encode,
    Deliver,
}

impl PipelineStage {
    pub const PRODUCTION_ORDER: [Self; 10] = [
        Self::Acquire,
        Self::NormalizeFormat,
        Self::Measure,
        Self::Downscale,
        Self::Split,
        Self::Upscale,
        Self::Merge,
        Self::Montage,
        Self::Encode,
        Self::Deliver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::NormalizeFormat => "normalize_format",
            Self::Measure => "measure",
            Self::Downscale => "downscale",
            Self::Split => "split",
            Self::Upscale => "upscale",
            Self::Merge => "merge",
            Self::Montage => "montage",
            Self::Encode => "encode",
            Self::Deliver => "deliver",
        }
    }

    /// Whether the stage body runs for `job`. Only meaningful once the job has
    /// been measured, since `split` is decided there. Dimensions are always
    /// read; `Measure` only counts as a stage when it marks the job for splitting.
    pub fn applies_to(self, job: &Job) -> bool {
        match self {
            Self::Measure | Self::Split | Self::Merge => job.split,
            Self::Downscale => job.downscale.is_some(),
            Self::Montage => job.wants_montage(),
            Self::Acquire
            | Self::NormalizeFormat
            | Self::Upscale
            | Self::Encode
            | Self::Deliver => true,
        }
    }
}

/// The stages a measured job goes through, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stages: Vec<PipelineStage>,
}

impl StagePlan {
    pub fn for_job(job: &Job) -> Self {
        Self {
            stages: PipelineStage::PRODUCTION_ORDER
                .into_iter()
                .filter(|stage| stage.applies_to(job))
                .collect(),
        }
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.as_str()).collect()
    }
}
