use std::fmt;

use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_RESIZE_FILTER: &str = "box";
pub const MODEL_FILE_EXTENSION: &str = ".pth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Url(Url),
    Attachment(Url),
}

impl SourceRef {
    pub fn url(&self) -> &Url {
        match self {
            Self::Url(url) | Self::Attachment(url) => url,
        }
    }
}

/// A model file name as it exists in the model directory, e.g. `4xBox.pth`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self(file_name.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The file name without the `.pth` suffix, used for labels.
    pub fn label(&self) -> &str {
        self.0
            .strip_suffix(MODEL_FILE_EXTENSION)
            .unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Where replies for a job go. The endpoint is opaque to the pipeline and only
/// interpreted by the configured reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub endpoint: String,
    pub author: Option<String>,
}

impl ReplyTarget {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Prefixes `text` with the requesting author, the way chat replies address them.
    pub fn addressed(&self, text: &str) -> String {
        match self.author.as_deref() {
            Some(author) if !author.is_empty() => format!("{author}, {text}"),
            _ => text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub source: SourceRef,
    pub model: ModelId,
    /// Current on-disk basename inside the input staging directory.
    pub image: String,
    pub downscale: Option<f64>,
    pub filter: String,
    pub montage: bool,
    pub split: bool,
    pub reply_to: ReplyTarget,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        source: SourceRef,
        model: ModelId,
        image: impl Into<String>,
        reply_to: ReplyTarget,
    ) -> Self {
        Self {
            id: JobId::new(),
            source,
            model,
            image: image.into(),
            downscale: None,
            filter: String::from(DEFAULT_RESIZE_FILTER),
            montage: false,
            split: false,
            reply_to,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_downscale(mut self, factor: f64) -> Self {
        self.downscale = Some(factor);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_montage(mut self, montage: bool) -> Self {
        self.montage = montage;
        self
    }

    /// Everything before the first `.` of the image name. Tiles, results and
    /// montages produced for this job all start with it.
    pub fn image_stem(&self) -> &str {
        image_stem(self.image.as_str())
    }

    pub fn wants_montage(&self) -> bool {
        self.montage && !self.split
    }
}

pub fn image_stem(image: &str) -> &str {
    image.split('.').next().unwrap_or(image)
}

pub fn image_extension(image: &str) -> Option<String> {
    image
        .rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}
