//! Request intake.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limits;
use crate::types::{DownloadRequest, DownloadStatus, RequestId, ZipRequest};

use super::ZipDownloader;

impl ZipDownloader {
    /// Submit a request to build a ZIP archive
    ///
    /// The request is registered, validated against the configured limits and,
    /// if valid, handed to a background pipeline. Limit violations are recorded
    /// on the request (status `failed`) and also returned.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once shutdown has started
    /// - [`Error::Download`] with a validation, count or size error when the
    ///   request breaks a limit
    pub async fn submit(&self, request: ZipRequest) -> Result<RequestId> {
        if !self.active.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let request =
            DownloadRequest::from_submission(request, self.config.processing.default_compression_level);
        let id = request.id;

        self.tracker.register(request.clone()).await?;
        self.tracker.transition(id, DownloadStatus::Validating).await?;

        if let Err(e) = limits::validate(&request, &self.config.limits) {
            tracing::info!(request_id = %id, error = %e, "Request rejected by limit policy");
            self.tracker.fail(id, e.clone()).await?;
            return Err(Error::Download(e));
        }

        let cancel = CancellationToken::new();
        self.active.tokens.lock().await.insert(id, cancel.clone());

        tracing::info!(
            request_id = %id,
            archive = %request.archive_name,
            files = request.blobs.len(),
            total_bytes = request.total_size(),
            level = request.compression_level.get(),
            "ZIP request accepted"
        );

        let downloader = self.clone();
        tokio::spawn(async move {
            downloader.run_pipeline(request, cancel).await;
        });

        Ok(id)
    }
}
