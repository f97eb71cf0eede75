//! Manifest source retrieval
//!
//! The manifest set lives at an operator-supplied locator: an `http(s)` URL
//! (a release artifact, a raw git file) or a path on the local filesystem
//! (a mounted ConfigMap, a checked-out repo). Retrieval is behind a trait so
//! the manifest store can be tested without network or disk.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Trait abstracting manifest byte retrieval
///
/// This trait allows mocking the source in tests while using the real
/// URL/filesystem fetcher in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Retrieve the raw manifest bytes behind `source`.
    ///
    /// Failures carry the source locator and the underlying cause; the
    /// caller decides whether that is fatal (startup) or a logged skip
    /// (periodic refresh).
    async fn fetch(&self, source: &str) -> Result<Vec<u8>>;
}

/// Production fetcher: `http(s)://` locators over HTTP, anything else read
/// from the local filesystem.
#[derive(Default)]
pub struct SourceFetcher;

#[async_trait]
impl ManifestFetcher for SourceFetcher {
    async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let response = reqwest::get(source)
                .await
                .map_err(|e| Error::fetch(format!("GET {source}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::fetch(format!("GET {source}: status {status}")));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| Error::fetch(format!("GET {source}: {e}")))?;
            Ok(bytes.to_vec())
        } else {
            tokio::fs::read(source)
                .await
                .map_err(|e| Error::fetch(format!("read {source}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_manifest_bytes_from_a_local_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "apiVersion: v1\nkind: ConfigMap").unwrap();

        let fetcher = SourceFetcher;
        let bytes = fetcher.fetch(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, b"apiVersion: v1\nkind: ConfigMap");
    }

    #[tokio::test]
    async fn missing_path_is_a_fetch_error_naming_the_source() {
        let fetcher = SourceFetcher;
        let err = fetcher.fetch("/nonexistent/manifests.yaml").await.unwrap_err();

        match &err {
            Error::Fetch(msg) => assert!(msg.contains("/nonexistent/manifests.yaml")),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let fetcher = SourceFetcher;
        let err = fetcher
            .fetch(&format!("http://{addr}/manifests.yaml"))
            .await
            .unwrap_err();

        match &err {
            Error::Fetch(msg) => assert!(msg.contains("404")),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }
}
