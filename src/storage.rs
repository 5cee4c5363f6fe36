//! Blob storage access through signed URLs
//!
//! [`BlobStore`] is the seam between the pipeline and object storage. Every call
//! takes a full signed URL (as issued by the SAS token service), so the store
//! itself holds no credentials.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use tokio_util::io::ReaderStream;

use crate::error::{DownloadError, DownloadErrorKind, Result};

/// Body of a blob being read, chunk by chunk
pub type BlobStream = BoxStream<'static, std::result::Result<Bytes, DownloadError>>;

/// Object storage operations used by the pipeline
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a blob for streaming reads
    async fn open_read(&self, url: &str) -> std::result::Result<BlobStream, DownloadError>;

    /// Upload a local file as a single blob, replacing any existing one
    async fn upload_file(
        &self,
        url: &str,
        path: &Path,
        size: u64,
        chunk_size: usize,
    ) -> std::result::Result<(), DownloadError>;

    /// Delete a blob. Deleting a blob that does not exist succeeds.
    async fn delete(&self, url: &str) -> std::result::Result<(), DownloadError>;
}

/// [`BlobStore`] speaking the blob REST protocol over HTTP
#[derive(Clone, Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
}

impl HttpBlobStore {
    /// Create a store with its own HTTP client
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("zip-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Create a store sharing an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn open_read(&self, url: &str) -> std::result::Result<BlobStream, DownloadError> {
        tracing::debug!(url = %redact(url), "Opening blob for read");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("GET", url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("GET", url, status));
        }

        let display = redact(url);
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| DownloadError::network(format!("reading {display}: {e}")))
        });
        Ok(stream.boxed())
    }

    async fn upload_file(
        &self,
        url: &str,
        path: &Path,
        size: u64,
        chunk_size: usize,
    ) -> std::result::Result<(), DownloadError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            DownloadError::from_io(
                DownloadErrorKind::Storage,
                &format!("opening {} for upload", path.display()),
                &e,
            )
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, chunk_size));

        tracing::debug!(url = %redact(url), size, "Uploading blob");

        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("PUT", url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("PUT", url, status));
        }
        Ok(())
    }

    async fn delete(&self, url: &str) -> std::result::Result<(), DownloadError> {
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| transport_error("DELETE", url, &e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("DELETE", url, status))
    }
}

/// Map a storage HTTP status to the failure it represents
pub(crate) fn status_error(method: &str, url: &str, status: StatusCode) -> DownloadError {
    let kind = match status {
        StatusCode::NOT_FOUND => DownloadErrorKind::FileNotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DownloadErrorKind::Permission,
        _ => DownloadErrorKind::Storage,
    };
    DownloadError::new(kind, format!("{method} {} returned {status}", redact(url)))
}

fn transport_error(method: &str, url: &str, err: &reqwest::Error) -> DownloadError {
    DownloadError::network(format!("{method} {} failed: {err}", redact(url)))
}

/// Strip the query string so signatures never reach logs or error messages
pub(crate) fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or_default().to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store() -> HttpBlobStore {
        HttpBlobStore::new(Duration::from_secs(5)).unwrap()
    }

    async fn collect(mut stream: BlobStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn open_read_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/container/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello blob".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/container/a.txt?sig=secret", server.uri());
        let stream = store().open_read(&url).await.unwrap();
        assert_eq!(collect(stream).await, b"hello blob");
    }

    #[tokio::test]
    async fn read_status_codes_map_to_kinds() {
        let server = MockServer::start().await;
        for (route, status) in [("/missing", 404), ("/denied", 403), ("/broken", 500)] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        let store = store();
        let kind = |route: &'static str| {
            let store = store.clone();
            let url = format!("{}{route}?sig=secret", server.uri());
            async move {
                match store.open_read(&url).await {
                    Ok(_) => panic!("{route} should fail"),
                    Err(e) => e,
                }
            }
        };

        let err = kind("/missing").await;
        assert_eq!(err.kind, DownloadErrorKind::FileNotFound);
        assert!(!err.message.contains("secret"), "signature leaked: {}", err.message);
        assert_eq!(kind("/denied").await.kind, DownloadErrorKind::Permission);
        assert_eq!(kind("/broken").await.kind, DownloadErrorKind::Storage);
    }

    #[tokio::test]
    async fn connection_failure_is_network_error() {
        // Nothing listens on the discard port on test hosts
        let err = match store().open_read("http://127.0.0.1:9/blob").await {
            Ok(_) => panic!("expected connection failure"),
            Err(e) => e,
        };
        assert_eq!(err.kind, DownloadErrorKind::Network);
    }

    #[tokio::test]
    async fn upload_sends_block_blob_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/temp-zips/download_1/out.zip"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(header("content-type", "application/zip"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.zip");
        std::fs::write(&file, b"PK fake archive").unwrap();

        let url = format!("{}/temp-zips/download_1/out.zip?sig=w", server.uri());
        store().upload_file(&url, &file, 15, 4).await.unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].body, b"PK fake archive");
    }

    #[tokio::test]
    async fn upload_rejection_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.zip");
        std::fs::write(&file, b"x").unwrap();

        let err = store()
            .upload_file(&format!("{}/c/out.zip", server.uri()), &file, 1, 8192)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DownloadErrorKind::Storage);
    }

    #[tokio::test]
    async fn delete_of_missing_blob_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        store()
            .delete(&format!("{}/c/gone.zip", server.uri()))
            .await
            .unwrap();
    }

    #[test]
    fn redact_strips_query() {
        assert_eq!(
            redact("https://acct.blob.example/c/a.txt?sv=1&sig=abc"),
            "https://acct.blob.example/c/a.txt"
        );
        assert_eq!(redact("not a url?sig=abc"), "not a url");
    }
}
