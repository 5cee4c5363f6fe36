//! Blob fetcher
//!
//! Streams each blob into its own spool file with bounded concurrency. A fetch
//! is retried on storage and network failures, bounded by a per-blob timeout
//! that covers every attempt, and aborted as soon as the request is cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryConfig};
use crate::error::{DownloadError, DownloadErrorKind, PipelineError};
use crate::retry::with_retry;
use crate::storage::BlobStore;
use crate::types::BlobReference;

/// One blob to fetch and the signed URL to read it from
#[derive(Clone, Debug)]
pub struct FetchJob {
    /// The requested blob
    pub blob: BlobReference,
    /// Signed read URL
    pub url: String,
}

/// A blob spooled to local disk
#[derive(Clone, Debug)]
pub struct FetchedBlob {
    /// The requested blob
    pub blob: BlobReference,
    /// Spool file holding the blob contents
    pub path: PathBuf,
    /// Bytes written to the spool file
    pub bytes: u64,
}

/// Fetches blobs from storage into spool files
///
/// Clones share one pool of fetch permits, so `max_concurrent_downloads`
/// bounds open fetches across every request in the process.
#[derive(Clone)]
pub struct BlobFetcher {
    store: Arc<dyn BlobStore>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    blob_timeout: Duration,
    chunk_size: usize,
    max_file_size: u64,
    concurrency: usize,
}

impl BlobFetcher {
    /// Create a fetcher using the processing, retry and limit settings from `config`
    pub fn new(store: Arc<dyn BlobStore>, config: &Config) -> Self {
        let concurrency = config.processing.max_concurrent_downloads.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(concurrency)),
            retry: config.retry.clone(),
            blob_timeout: config.processing.blob_timeout,
            chunk_size: config.processing.chunk_size,
            max_file_size: config.limits.max_file_size_bytes,
            concurrency,
        }
    }

    /// Fetch every job, at most `concurrency` at a time
    ///
    /// Each fetch also waits for a permit from the shared pool. Results are returned in job order regardless of completion order. The
    /// first failure cancels the remaining fetches and is returned.
    pub async fn fetch_all(
        &self,
        jobs: Vec<FetchJob>,
        spool_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedBlob>, PipelineError> {
        let pool_token = cancel.child_token();
        let total = jobs.len();

        let mut pending = futures::stream::iter(jobs.into_iter().enumerate().map(|(index, job)| {
            let token = pool_token.clone();
            let dest = spool_dir.join(format!("{index:04}.part"));
            async move {
                let bytes = self.fetch_to_file(&job.blob, &job.url, &dest, &token).await?;
                Ok::<_, PipelineError>((
                    index,
                    FetchedBlob {
                        blob: job.blob,
                        path: dest,
                        bytes,
                    },
                ))
            }
            .boxed()
        }))
        .buffer_unordered(self.concurrency);

        let mut slots: Vec<Option<FetchedBlob>> = (0..total).map(|_| None).collect();
        while let Some(result) = pending.next().await {
            match result {
                Ok((index, fetched)) => {
                    tracing::debug!(
                        blob = %fetched.blob.path,
                        bytes = fetched.bytes,
                        "Blob fetched"
                    );
                    slots[index] = Some(fetched);
                }
                Err(e) => {
                    pool_token.cancel();
                    return Err(e);
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    PipelineError::Failed(DownloadError::new(
                        DownloadErrorKind::Unknown,
                        "fetch finished without a result",
                    ))
                })
            })
            .collect()
    }

    /// Fetch one blob into `dest`, returning the number of bytes written
    ///
    /// Waits for a fetch permit first; the per-blob timeout starts once it is held.
    pub async fn fetch_to_file(
        &self,
        blob: &BlobReference,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| {
                PipelineError::Failed(
                    DownloadError::new(DownloadErrorKind::Unknown, "fetch pool closed")
                        .with_blob(blob),
                )
            })?,
        };

        let attempts = with_retry(&self.retry, || self.fetch_once(blob, url, dest, cancel));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(self.blob_timeout, attempts) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        blob = %blob.path,
                        timeout_secs = self.blob_timeout.as_secs(),
                        "Blob fetch timed out"
                    );
                    Err(PipelineError::Failed(
                        DownloadError::timeout(format!(
                            "fetching {} took longer than {}s",
                            blob.path,
                            self.blob_timeout.as_secs()
                        ))
                        .with_blob(blob),
                    ))
                }
            },
        }
    }

    async fn fetch_once(
        &self,
        blob: &BlobReference,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let mut stream = self
            .store
            .open_read(url)
            .await
            .map_err(|e| e.with_blob(blob))?;

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| spool_error(blob, "creating spool file", &e))?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut hasher = blob.content_hash.as_ref().map(|_| Sha256::new());
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| e.with_blob(blob))?;

            written += chunk.len() as u64;
            if written > self.max_file_size {
                return Err(PipelineError::Failed(
                    DownloadError::new(
                        DownloadErrorKind::SizeLimitExceeded,
                        format!(
                            "{} exceeded the per-file limit of {} bytes while streaming",
                            blob.path, self.max_file_size
                        ),
                    )
                    .with_blob(blob),
                ));
            }

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| spool_error(blob, "writing spool file", &e))?;
        }

        writer
            .flush()
            .await
            .map_err(|e| spool_error(blob, "flushing spool file", &e))?;

        if let (Some(expected), Some(hasher)) = (&blob.content_hash, hasher) {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(PipelineError::Failed(
                    DownloadError::storage(format!(
                        "content hash mismatch for {}: expected {expected}, got {actual}",
                        blob.path
                    ))
                    .with_blob(blob),
                ));
            }
        }

        if written != blob.size {
            tracing::debug!(
                blob = %blob.path,
                declared = blob.size,
                actual = written,
                "Blob size differs from declared size"
            );
        }

        Ok(written)
    }
}

fn spool_error(blob: &BlobReference, context: &str, err: &std::io::Error) -> PipelineError {
    PipelineError::Failed(
        DownloadError::from_io(DownloadErrorKind::Storage, context, err).with_blob(blob),
    )
}
