//! Per-request pipeline: tokens, fetch, archive, upload, finalize.

use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;

use futures::{FutureExt, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::error::{DownloadError, DownloadErrorKind, Error, PipelineError};
use crate::fetcher::FetchJob;
use crate::retry::with_retry;
use crate::types::{AccessType, ArchiveResult, DownloadRequest, DownloadStatus, RequestId};

use super::ZipDownloader;

impl ZipDownloader {
    /// Drive one validated request to a final status
    ///
    /// Runs under the overall processing deadline. Whatever the outcome, the
    /// request's working directory is removed, and a destination object left by
    /// a failed or cancelled run is deleted.
    pub(crate) async fn run_pipeline(&self, request: DownloadRequest, cancel: CancellationToken) {
        let id = request.id;
        let work_dir = self.work_dir(id);
        let destination = request.destination_path(&self.config.storage.temp_container);
        let write_url = OnceLock::new();
        let deadline = self.config.processing.max_processing_time;

        // Upload ignores user cancellation but not the deadline
        let deadline_token = CancellationToken::new();
        let work = self.execute(
            &request,
            &work_dir,
            &destination,
            &cancel,
            &deadline_token,
            &write_url,
        );
        tokio::pin!(work);

        let outcome = tokio::select! {
            result = &mut work => Some(result),
            _ = tokio::time::sleep(deadline) => None,
        };
        // Drain the stopped pipeline so blocking archive work ends before cleanup
        let outcome = match outcome {
            Some(result) => Ok(result),
            None => {
                cancel.cancel();
                deadline_token.cancel();
                let _ = work.await;
                Err(())
            }
        };

        let succeeded = match outcome {
            Ok(Ok(result)) => {
                tracing::info!(
                    request_id = %id,
                    destination = %result.destination,
                    size_bytes = result.size_bytes,
                    entries = result.entry_count,
                    "ZIP request completed"
                );
                match self.tracker.complete(id, result).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(request_id = %id, error = %e, "Could not record completion");
                        false
                    }
                }
            }
            Ok(Err(PipelineError::Cancelled)) => {
                self.record_cancelled(id).await;
                false
            }
            Ok(Err(PipelineError::Failed(error))) => {
                tracing::warn!(request_id = %id, error = %error, "ZIP request failed");
                self.record_failure(id, error).await;
                false
            }
            Err(()) => {
                tracing::warn!(
                    request_id = %id,
                    timeout_secs = deadline.as_secs(),
                    "ZIP request exceeded the processing deadline"
                );
                self.record_failure(
                    id,
                    DownloadError::timeout(format!(
                        "processing took longer than {}s",
                        deadline.as_secs()
                    )),
                )
                .await;
                false
            }
        };

        if !succeeded && let Some(url) = write_url.get() {
            if let Err(e) = self.store.delete(url).await {
                tracing::warn!(
                    request_id = %id,
                    destination = %destination,
                    error = %e,
                    "Failed to delete partial archive"
                );
            } else {
                tracing::debug!(request_id = %id, destination = %destination, "Partial archive deleted");
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                request_id = %id,
                path = ?work_dir,
                error = %e,
                "Failed to delete request temp directory"
            );
        }

        self.active.tokens.lock().await.remove(&id);
    }

    async fn execute(
        &self,
        request: &DownloadRequest,
        work_dir: &Path,
        destination: &str,
        cancel: &CancellationToken,
        deadline_token: &CancellationToken,
        write_url: &OnceLock<String>,
    ) -> Result<ArchiveResult, PipelineError> {
        let id = request.id;
        let config = &self.config;

        self.advance(id, DownloadStatus::Processing, cancel).await?;
        let jobs = cancellable(cancel, self.sas_phase(move || self.read_tokens(request))).await?;

        self.advance(id, DownloadStatus::Downloading, cancel).await?;
        tokio::fs::create_dir_all(work_dir).await.map_err(|e| {
            DownloadError::from_io(DownloadErrorKind::Storage, "creating request temp directory", &e)
        })?;
        let fetched = self.fetcher.fetch_all(jobs, work_dir, cancel).await?;

        self.advance(id, DownloadStatus::Compressing, cancel).await?;
        let entries = fetched
            .into_iter()
            .map(|f| (f.blob.entry_name().to_string(), f.path))
            .collect();
        let built = archive::build_archive_file(
            entries,
            work_dir.join("archive.zip"),
            request.compression_level,
            config.processing.chunk_size,
            cancel.clone(),
        )
        .await?;
        tracing::debug!(
            request_id = %id,
            size_bytes = built.size_bytes,
            entries = built.entry_count,
            "Archive built"
        );

        let write = cancellable(
            cancel,
            self.sas_phase(move || async move {
                self.sas
                    .request_token(destination, AccessType::Write, config.sas.token_expiry)
                    .await
                    .map_err(PipelineError::from)
            }),
        )
        .await?;

        // Past this point only the deadline stops the upload
        self.advance(id, DownloadStatus::Uploading, cancel).await?;
        let _ = write_url.set(write.url.clone());
        let (url, path, size) = (write.url.as_str(), built.path.as_path(), built.size_bytes);
        cancellable(
            deadline_token,
            async move {
                with_retry(&config.retry, move || {
                    self.store
                        .upload_file(url, path, size, config.processing.chunk_size)
                })
                .await
                .map_err(PipelineError::from)
            },
        )
        .await?;

        let read = cancellable(
            deadline_token,
            self.sas_phase(move || async move {
                self.sas
                    .request_token(destination, AccessType::Read, config.processing.zip_expiry)
                    .await
                    .map_err(PipelineError::from)
            }),
        )
        .await?;

        Ok(ArchiveResult {
            destination: destination.to_string(),
            url: read.url,
            expires_at: read.expires_at,
            size_bytes: built.size_bytes,
            entry_count: built.entry_count,
        })
    }

    /// Request a read URL for every blob, preserving request order
    async fn read_tokens(&self, request: &DownloadRequest) -> Result<Vec<FetchJob>, PipelineError> {
        let validity = self.config.sas.token_expiry;
        let lookups: Vec<_> = request
            .blobs
            .iter()
            .map(|blob| {
                async move {
                    let token = self
                        .sas
                        .request_token(&blob.path, AccessType::Read, validity)
                        .await
                        .map_err(|e| e.with_blob(blob))?;
                    Ok::<_, DownloadError>(FetchJob {
                        blob: blob.clone(),
                        url: token.url,
                    })
                }
                .boxed()
            })
            .collect();
        futures::stream::iter(lookups)
        .buffered(self.config.processing.max_concurrent_downloads.max(1))
        .try_collect()
        .await
        .map_err(PipelineError::from)
    }

    /// Run a token phase, repeating it after a cooldown when the token service fails
    async fn sas_phase<T, F, Fut>(&self, mut phase: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let retries = self.config.sas.phase_retries;
        let mut attempt = 0;
        loop {
            match phase().await {
                Err(PipelineError::Failed(e))
                    if e.kind == DownloadErrorKind::SasService && attempt < retries =>
                {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        cooldown_secs = self.config.sas.retry_cooldown.as_secs(),
                        "Token service failed, retrying phase"
                    );
                    tokio::time::sleep(self.config.sas.retry_cooldown).await;
                }
                other => return other,
            }
        }
    }

    /// Move to the next status unless the request has been cancelled
    async fn advance(
        &self,
        id: RequestId,
        to: DownloadStatus,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.tracker.transition(id, to).await {
            Ok(_) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) => Err(PipelineError::Failed(e.into_download_error())),
        }
    }

    async fn record_cancelled(&self, id: RequestId) {
        match self.tracker.transition(id, DownloadStatus::Cancelled).await {
            Ok(_) => tracing::info!(request_id = %id, "ZIP request cancelled"),
            // cancel() already recorded it
            Err(Error::InvalidTransition {
                from: DownloadStatus::Cancelled,
                ..
            }) => tracing::info!(request_id = %id, "ZIP request cancelled"),
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Could not record cancellation")
            }
        }
    }

    async fn record_failure(&self, id: RequestId, error: DownloadError) {
        match self.tracker.fail(id, error).await {
            Ok(_) => {}
            Err(Error::InvalidTransition {
                from: DownloadStatus::Cancelled,
                ..
            }) => tracing::debug!(request_id = %id, "Failure after cancellation ignored"),
            Err(e) => tracing::error!(request_id = %id, error = %e, "Could not record failure"),
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = work => result,
    }
}
