pub mod parse;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::models::{with_model_extension, ModelRegistry, ModelResolver};
use crate::pipeline::acquire::{SharedImageFetcher, TransferError};
use crate::pipeline::job::{Job, ReplyTarget, SourceRef};
use crate::worker::{EnqueueOutcome, UpscaleQueue};

use parse::{
    is_accepted_image, is_safe_model_name, parse_upscale, rewrite_drive_link, split_command,
    ParsedSource,
};

const MODELS_PER_ROW: usize = 4;

/// A chat message as forwarded by the platform bridge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncomingMessage {
    pub content: String,
    pub author: String,
    pub author_is_bot: bool,
    pub attachments: Vec<Url>,
    pub reply_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledMessage {
    /// Not addressed to the bot: wrong prefix, bot author or unknown command.
    Ignored,
    Replied(Vec<String>),
}

impl HandledMessage {
    pub fn replies(&self) -> &[String] {
        match self {
            Self::Ignored => &[],
            Self::Replied(replies) => replies.as_slice(),
        }
    }
}

pub struct CommandHandler {
    prefix: String,
    registry: Arc<ModelRegistry>,
    queue: UpscaleQueue,
    model_fetcher: SharedImageFetcher,
}

impl CommandHandler {
    pub fn new(
        prefix: impl Into<String>,
        registry: Arc<ModelRegistry>,
        queue: UpscaleQueue,
        model_fetcher: SharedImageFetcher,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            registry,
            queue,
            model_fetcher,
        }
    }

    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    /// Runs a message through the command surface. User mistakes come back as
    /// reply text; only messages the bot should not answer are `Ignored`.
    pub async fn handle(&self, message: &IncomingMessage) -> HandledMessage {
        if message.author_is_bot {
            return HandledMessage::Ignored;
        }
        let Some(line) = split_command(self.prefix.as_str(), message.content.as_str()) else {
            return HandledMessage::Ignored;
        };

        let result = match line.name.as_str() {
            "upscale" => self.upscale(message, line.args.as_slice()).map(|r| vec![r]),
            "models" => Ok(vec![models_table(self.registry.names().as_slice())]),
            "add" => self.add(line.args.as_slice()).await.map(|r| vec![r]),
            "help" => Ok(vec![help_text(self.prefix.as_str())]),
            _ => return HandledMessage::Ignored,
        };
        match result {
            Ok(replies) => HandledMessage::Replied(replies),
            Err(error) => {
                if let CommandError::ModelDownload { source, .. } = &error {
                    warn!(error = %source, "model download failed");
                }
                HandledMessage::Replied(vec![error.to_string()])
            }
        }
    }

    fn upscale(&self, message: &IncomingMessage, args: &[String]) -> Result<String, CommandError> {
        let parsed = parse_upscale(args, message.attachments.as_slice(), message.author.as_str())?;
        let model = self
            .registry
            .resolve_model(with_model_extension(parsed.model.as_str()).as_str())
            .filter(|model| self.registry.contains(model.as_str()))
            .ok_or(CommandError::InvalidModel)?;
        if !is_accepted_image(parsed.image.as_str()) {
            return Err(CommandError::UnsupportedImage);
        }

        let source = match parsed.source {
            ParsedSource::Attachment(url) => SourceRef::Attachment(url),
            ParsedSource::Link(url) => SourceRef::Url(url),
        };
        let reply_to =
            ReplyTarget::new(message.reply_to.as_str()).with_author(message.author.as_str());
        let mut job = Job::new(source, model, parsed.image.as_str(), reply_to)
            .with_filter(parsed.filter)
            .with_montage(parsed.montage);
        if let Some(factor) = parsed.downscale {
            job = job.with_downscale(factor);
        }

        Ok(match self.queue.enqueue(job) {
            EnqueueOutcome::Started { .. } => String::from("Your image is being processed."),
            EnqueueOutcome::Queued { position, .. } => format!(
                "{} has been added to the queue! Your image is #{position} in line for processing.",
                parsed.image
            ),
        })
    }

    async fn add(&self, args: &[String]) -> Result<String, CommandError> {
        let (Some(raw_url), Some(nickname)) = (args.first(), args.get(1)) else {
            return Err(CommandError::InvalidCommand);
        };
        let name = with_model_extension(nickname.as_str());
        if !is_safe_model_name(name.as_str()) {
            return Err(CommandError::InvalidCommand);
        }
        let url = Url::parse(rewrite_drive_link(raw_url.as_str()).as_str())
            .map_err(|_| CommandError::InvalidCommand)?;

        let destination = self.registry.model_path(name.as_str());
        self.model_fetcher
            .fetch(&url, destination.as_path())
            .await
            .map_err(|source| CommandError::ModelDownload {
                name: name.clone(),
                source,
            })?;
        self.registry.add(name.as_str());
        info!(model = %name, "model added");
        Ok(format!("{name} has been added to the model list."))
    }
}

/// Model file names laid out as a borderless markdown table in a code block.
pub fn models_table(names: &[String]) -> String {
    if names.is_empty() {
        return String::from("No models are installed.");
    }
    let columns = names.len().min(MODELS_PER_ROW);
    let mut widths = vec![0usize; columns];
    for row in names.chunks(MODELS_PER_ROW) {
        for (col, name) in row.iter().enumerate() {
            widths[col] = widths[col].max(name.chars().count());
        }
    }

    let mut out = String::from("```\n");
    for row in names.chunks(MODELS_PER_ROW) {
        let cells = (0..columns)
            .map(|col| {
                let cell = row.get(col).map(String::as_str).unwrap_or("");
                format!("{cell:<width$}", width = widths[col])
            })
            .collect::<Vec<_>>();
        out.push_str("| ");
        out.push_str(cells.join(" | ").as_str());
        out.push_str(" |\n");
    }
    out.push_str("```");
    out
}

pub fn help_text(prefix: &str) -> String {
    format!(
        "Commands:

`{prefix}upscale [model]` // Upscales attached image using specified model

`{prefix}upscale [url] [model]` // Upscales linked image using specified model

`{prefix}add [model url] [nickname]` // Adds model from url, with a nickname (to avoid typing out long model names)

`{prefix}models` // Lists all models

`{prefix}help` // Shows this information again

Optional upscale args:

`-downscale [amount]` // Downscales the image by the amount listed

`-filter [imagemagick filter]` // Filter to be used for downscaling. Must be valid imagemagick filter. Defaults to box.

`-montage` // Creates a side by side comparison of the LR and result after upscaling

Example: `{prefix}upscale www.imageurl.com/image.png 4xBox.pth -downscale 4 -filter point -montage`"
    )
}

/// Display text is the reply sent back to the user.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("You didn't provide any arguments, {author}!")]
    NoArguments { author: String },
    #[error("Not a valid command.")]
    InvalidCommand,
    #[error("Not a valid model.")]
    InvalidModel,
    #[error("Sorry, that image cannot be processed.")]
    UnsupportedImage,
    #[error("Sorry, {name} could not be downloaded.")]
    ModelDownload {
        name: String,
        #[source]
        source: TransferError,
    },
}
