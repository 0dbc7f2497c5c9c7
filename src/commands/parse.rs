use url::Url;

use crate::commands::CommandError;
use crate::pipeline::job::{image_extension, DEFAULT_RESIZE_FILTER};

const ACCEPTED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const IMAGE_URL_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "gif", "bmp"];

/// A prefixed message split into a lower-cased command name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub name: String,
    pub args: Vec<String>,
}

pub fn split_command(prefix: &str, content: &str) -> Option<CommandLine> {
    let rest = content.strip_prefix(prefix)?;
    let mut parts = rest.split(' ').filter(|part| !part.is_empty());
    let name = parts.next()?.to_lowercase();
    Some(CommandLine {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleArgs {
    pub source: ParsedSource,
    pub image: String,
    pub model: String,
    pub downscale: Option<f64>,
    pub filter: String,
    pub montage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSource {
    Attachment(Url),
    Link(Url),
}

impl ParsedSource {
    pub fn url(&self) -> &Url {
        match self {
            Self::Attachment(url) | Self::Link(url) => url,
        }
    }
}

/// `upscale [url] <model> [-downscale N] [-filter F] [-montage]`. The model
/// name is returned as typed; resolution against the registry happens later.
pub fn parse_upscale(
    args: &[String],
    attachments: &[Url],
    author: &str,
) -> Result<UpscaleArgs, CommandError> {
    if args.is_empty() {
        return Err(CommandError::NoArguments {
            author: author.to_string(),
        });
    }

    let mut rest = args;
    let raw_source = if let Some(attachment) = attachments.first() {
        SourceCandidate::Attachment(attachment.as_str())
    } else if is_image_url(args[0].as_str()) {
        rest = &args[1..];
        SourceCandidate::Link(args[0].as_str())
    } else {
        return Err(CommandError::InvalidCommand);
    };

    let sanitized = sanitize_url(raw_source.as_str());
    let url = Url::parse(sanitized).map_err(|_| CommandError::InvalidCommand)?;
    let image = sanitized
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or(CommandError::InvalidCommand)?
        .to_string();
    let source = match raw_source {
        SourceCandidate::Attachment(_) => ParsedSource::Attachment(url),
        SourceCandidate::Link(_) => ParsedSource::Link(url),
    };

    let model = rest.first().ok_or(CommandError::InvalidCommand)?.clone();
    let mut parsed = UpscaleArgs {
        source,
        image,
        model,
        downscale: None,
        filter: String::from(DEFAULT_RESIZE_FILTER),
        montage: false,
    };

    let flags = &rest[1..];
    if let Some(value) = flag_value(flags, "-downscale") {
        let factor = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or(CommandError::InvalidCommand)?;
        parsed.downscale = Some(factor);
    } else if has_flag(flags, "-downscale") {
        return Err(CommandError::InvalidCommand);
    }
    if let Some(value) = flag_value(flags, "-filter") {
        parsed.filter = value.to_string();
    } else if has_flag(flags, "-filter") {
        return Err(CommandError::InvalidCommand);
    }
    parsed.montage = has_flag(flags, "-montage");

    Ok(parsed)
}

enum SourceCandidate<'a> {
    Attachment(&'a str),
    Link(&'a str),
}

impl<'a> SourceCandidate<'a> {
    fn as_str(&self) -> &'a str {
        match self {
            Self::Attachment(v) | Self::Link(v) => v,
        }
    }
}

/// Drops everything from the first `&`, then everything from the first `?`.
pub fn sanitize_url(raw: &str) -> &str {
    let raw = raw.split('&').next().unwrap_or(raw);
    raw.split('?').next().unwrap_or(raw)
}

pub fn is_image_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    image_extension(url.path())
        .is_some_and(|ext| IMAGE_URL_EXTENSIONS.contains(&ext.as_str()))
}

/// Only formats the converter and upscaler are known to handle.
pub fn is_accepted_image(image: &str) -> bool {
    image_extension(image).is_some_and(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Google Drive share links (`/file/d/<id>/view`) point at an HTML page; the
/// direct download form is needed to fetch the file itself.
pub fn rewrite_drive_link(raw: &str) -> String {
    if !raw.contains("drive.google.com") {
        return raw.to_string();
    }
    let trimmed = sanitize_url(raw).trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/view").unwrap_or(trimmed);
    match trimmed.rsplit('/').next().filter(|id| !id.is_empty()) {
        Some(id) => format!("https://docs.google.com/uc?export=download&id={id}"),
        None => raw.to_string(),
    }
}

/// Model nicknames become file names inside the model directory.
pub fn is_safe_model_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

fn has_flag(flags: &[String], flag: &str) -> bool {
    flags.iter().any(|arg| arg == flag)
}

fn flag_value<'a>(flags: &'a [String], flag: &str) -> Option<&'a str> {
    let index = flags.iter().position(|arg| arg == flag)?;
    flags
        .get(index + 1)
        .map(String::as_str)
        .filter(|value| !value.starts_with('-') || value.parse::<f64>().is_ok())
}
