use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clipflow_core::ArtifactFetcher;
use futures::StreamExt;
use reqwest::Client;
use tracing::debug;

use crate::client::{HttpConfig, ensure_success};
use crate::error::HttpError;

/// Default cap on a single artifact download.
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 1024 * 1024 * 1024;

/// Downloads generated artifacts from absolute URLs (usually signed CDN
/// links, so no credentials are attached).
pub struct HttpArtifactFetcher {
    client: Client,
    max_bytes: u64,
}

impl HttpArtifactFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        let anonymous = HttpConfig {
            token: None,
            ..config.clone()
        };
        Ok(Self {
            client: anonymous.build_client()?,
            max_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn download(&self, url: &str) -> Result<Bytes, HttpError> {
        let response = ensure_success(self.client.get(url).send().await?).await?;
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(HttpError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(HttpError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(url, size = body.len(), "artifact fetched");
        Ok(body.freeze())
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> clipflow_core::Result<Bytes> {
        Ok(self.download(url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipflow_core::ErrorKind;

    #[tokio::test]
    async fn fetches_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/out/a.mp4")
            .with_body(b"\x00\x00\x00\x18ftyp")
            .create_async()
            .await;

        let fetcher = HttpArtifactFetcher::new(&HttpConfig::new(server.url())).unwrap();
        let bytes = fetcher
            .fetch(&format!("{}/out/a.mp4", server.url()))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"\x00\x00\x00\x18ftyp");
    }

    #[tokio::test]
    async fn oversized_artifact_is_refused() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big.mp4")
            .with_body(vec![0u8; 64])
            .create_async()
            .await;

        let fetcher = HttpArtifactFetcher::new(&HttpConfig::new(server.url()))
            .unwrap()
            .with_max_bytes(16);
        let err = fetcher
            .fetch(&format!("{}/big.mp4", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("exceeds 16 bytes"));
    }

    #[tokio::test]
    async fn expired_link_is_not_a_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gone.mp4")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = HttpArtifactFetcher::new(&HttpConfig::new(server.url())).unwrap();
        assert!(fetcher.fetch(&format!("{}/gone.mp4", server.url())).await.is_err());
    }
}
