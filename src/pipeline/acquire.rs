use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// Downloads a remote file to a local path, returning the number of bytes written.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &Url, destination: &Path) -> Result<u64, TransferError>;
}

pub type SharedImageFetcher = Arc<dyn ImageFetcher>;

#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    max_bytes: Option<u64>,
}

impl HttpImageFetcher {
    pub fn new(max_bytes: Option<u64>) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(TransferError::Client)?;
        Ok(Self { client, max_bytes })
    }

    async fn stream_to_file(&self, url: &Url, destination: &Path) -> Result<u64, TransferError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(TransferError::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: url.to_string(),
                status,
            });
        }
        if let (Some(limit), Some(len)) = (self.max_bytes, response.content_length()) {
            if len > limit {
                return Err(TransferError::TooLarge { limit });
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(TransferError::Io)?;
        }
        let mut file = fs::File::create(destination)
            .await
            .map_err(TransferError::Io)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(TransferError::Request)? {
            written += chunk.len() as u64;
            if self.max_bytes.is_some_and(|limit| written > limit) {
                return Err(TransferError::TooLarge {
                    limit: self.max_bytes.unwrap_or_default(),
                });
            }
            file.write_all(&chunk).await.map_err(TransferError::Io)?;
        }
        file.flush().await.map_err(TransferError::Io)?;
        Ok(written)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    /// Streams into a `.part` sibling and only replaces `destination` once the
    /// whole body arrived, so a failed download never touches an existing file.
    async fn fetch(&self, url: &Url, destination: &Path) -> Result<u64, TransferError> {
        debug!(url = %url, destination = %destination.display(), "downloading");
        let partial = partial_path(destination);
        let result = match self.stream_to_file(url, partial.as_path()).await {
            Ok(bytes) => fs::rename(partial.as_path(), destination)
                .await
                .map(|()| bytes)
                .map_err(TransferError::Io),
            Err(error) => Err(error),
        };
        if result.is_err() {
            if let Err(cleanup) = fs::remove_file(partial.as_path()).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        partial = %partial.display(),
                        error = %cleanup,
                        "failed to remove partial download"
                    );
                }
            }
        }
        result
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("download"));
    name.push(".part");
    destination.with_file_name(name)
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("http client init failed: {0}")]
    Client(#[source] reqwest::Error),
    #[error("download request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("download of {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("download exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("could not write download: {0}")]
    Io(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::temp_root;
    use axum::routing::get;
    use axum::Router;

    async fn serve(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    #[tokio::test]
    async fn fetch_writes_body_to_destination() {
        let addr = serve(Router::new().route("/cat.png", get(|| async { "pngbytes" }))).await;
        let root = temp_root("acquire_ok");
        let dest = root.join("LR/cat.png");
        let fetcher = HttpImageFetcher::new(None).expect("client");
        let url = Url::parse(&format!("http://{addr}/cat.png")).expect("url");

        let bytes = fetcher.fetch(&url, &dest).await.expect("fetch should succeed");

        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read(dest).expect("downloaded file"), b"pngbytes");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn non_success_status_leaves_no_file() {
        let addr = serve(Router::new()).await;
        let root = temp_root("acquire_404");
        let dest = root.join("cat.png");
        let fetcher = HttpImageFetcher::new(None).expect("client");
        let url = Url::parse(&format!("http://{addr}/missing.png")).expect("url");

        let err = fetcher.fetch(&url, &dest).await.expect_err("404 should fail");

        assert!(matches!(err, TransferError::Status { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(!dest.exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn oversized_download_is_rejected_and_removed() {
        let addr = serve(Router::new().route("/big.png", get(|| async { "0123456789" }))).await;
        let root = temp_root("acquire_big");
        let dest = root.join("big.png");
        let fetcher = HttpImageFetcher::new(Some(4)).expect("client");
        let url = Url::parse(&format!("http://{addr}/big.png")).expect("url");

        let err = fetcher.fetch(&url, &dest).await.expect_err("limit should apply");

        assert!(matches!(err, TransferError::TooLarge { limit: 4 }));
        assert!(!dest.exists());
        assert!(!root.join("big.png.part").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn failed_download_keeps_existing_file() {
        let addr = serve(Router::new().route("/big.pth", get(|| async { "0123456789" }))).await;
        let root = temp_root("acquire_existing");
        let dest = root.join("4xBox.pth");
        std::fs::write(&dest, b"existing model weights").expect("seed existing file");
        let fetcher = HttpImageFetcher::new(Some(4)).expect("client");

        for url in [
            format!("http://{addr}/missing.pth"),
            format!("http://{addr}/big.pth"),
            String::from("http://127.0.0.1:1/model.pth"),
        ] {
            let url = Url::parse(url.as_str()).expect("url");
            fetcher.fetch(&url, &dest).await.expect_err("download should fail");
            assert_eq!(
                std::fs::read(&dest).expect("existing file should survive"),
                b"existing model weights"
            );
        }
        assert!(!root.join("4xBox.pth.part").exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn successful_download_replaces_existing_file() {
        let addr = serve(Router::new().route("/new.pth", get(|| async { "new" }))).await;
        let root = temp_root("acquire_replace");
        let dest = root.join("4xBox.pth");
        std::fs::write(&dest, b"old").expect("seed existing file");
        let fetcher = HttpImageFetcher::new(None).expect("client");
        let url = Url::parse(&format!("http://{addr}/new.pth")).expect("url");

        fetcher.fetch(&url, &dest).await.expect("fetch should succeed");

        assert_eq!(std::fs::read(&dest).expect("replaced file"), b"new");
        assert!(!root.join("4xBox.pth.part").exists());

        let _ = std::fs::remove_dir_all(root);
    }
}
