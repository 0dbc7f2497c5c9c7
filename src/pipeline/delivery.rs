use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::pipeline::job::ReplyTarget;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyMessage {
    pub content: String,
    pub files: Vec<PathBuf>,
}

impl ReplyMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }
}

#[async_trait]
pub trait ReplyChannel: Send + Sync + 'static {
    async fn send(&self, target: &ReplyTarget, message: ReplyMessage) -> Result<(), DeliveryError>;
}

pub type SharedReplyChannel = Arc<dyn ReplyChannel>;

/// Posts replies as `multipart/form-data` to the target endpoint: a `content`
/// part plus one `files[i]` part per attachment.
#[derive(Debug, Clone, Default)]
pub struct WebhookReplyChannel {
    client: Client,
}

impl WebhookReplyChannel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn build_form(message: &ReplyMessage) -> Result<multipart::Form, DeliveryError> {
        let mut form = multipart::Form::new().text("content", message.content.clone());
        for (index, path) in message.files.iter().enumerate() {
            let bytes = fs::read(path.as_path())
                .await
                .map_err(|source| DeliveryError::Attachment {
                    path: path.clone(),
                    source,
                })?;
            let file_name = path
                .file_name()
                .map(|v| v.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("file{index}"));
            let mime = mime_for_path(path.as_path());
            let part = multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime)
                .map_err(DeliveryError::Request)?;
            form = form.part(format!("files[{index}]"), part);
        }
        Ok(form)
    }
}

#[async_trait]
impl ReplyChannel for WebhookReplyChannel {
    async fn send(&self, target: &ReplyTarget, message: ReplyMessage) -> Result<(), DeliveryError> {
        if target.endpoint.trim().is_empty() {
            return Err(DeliveryError::NoEndpoint);
        }
        let form = Self::build_form(&message).await?;
        debug!(
            endpoint = %target.endpoint,
            files = message.files.len(),
            "posting reply"
        );
        let resp = self
            .client
            .post(target.endpoint.as_str())
            .multipart(form)
            .send()
            .await
            .map_err(DeliveryError::Request)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                endpoint: target.endpoint.clone(),
                status,
            });
        }
        Ok(())
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("reply target has no endpoint")]
    NoEndpoint,
    #[error("could not read attachment {}: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reply request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("reply endpoint {endpoint} returned {status}")]
    Status { endpoint: String, status: StatusCode },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_root;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;

    type Received = Arc<Mutex<Vec<String>>>;

    async fn record(State(received): State<Received>, body: Bytes) {
        received
            .lock()
            .expect("received mutex poisoned")
            .push(String::from_utf8_lossy(&body).to_string());
    }

    #[test]
    fn mime_for_path_covers_delivered_formats() {
        assert_eq!(mime_for_path(Path::new("a_rlt.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("a_rlt.webp")), "image/webp");
        assert_eq!(mime_for_path(Path::new("a_rlt")), "application/octet-stream");
    }

    #[tokio::test]
    async fn webhook_posts_content_and_indexed_files() {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route("/reply", post(record))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let root = temp_root("delivery_webhook");
        let result = root.join("cat_rlt.png");
        std::fs::write(result.as_path(), b"result").expect("result file");

        WebhookReplyChannel::default()
            .send(
                &ReplyTarget::new(format!("http://{addr}/reply")),
                ReplyMessage::text("Upscaled using 4xBox.pth").with_file(result),
            )
            .await
            .expect("delivery should succeed");

        let received = received.lock().expect("received mutex poisoned").clone();
        assert_eq!(received.len(), 1);
        let body = received[0].as_str();
        assert!(body.contains("name=\"content\""));
        assert!(body.contains("Upscaled using 4xBox.pth"));
        assert!(body.contains("files[0]"));
        assert!(body.contains("filename=\"cat_rlt.png\""));

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_attachment_is_delivery_error() {
        let err = WebhookReplyChannel::default()
            .send(
                &ReplyTarget::new("http://127.0.0.1:9/reply"),
                ReplyMessage::text("x").with_file("/nonexistent/cat_rlt.png"),
            )
            .await
            .expect_err("missing file should fail");

        assert!(matches!(err, DeliveryError::Attachment { .. }));
    }
}
