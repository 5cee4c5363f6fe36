//! Request control: status queries and cancellation.

use crate::error::{Error, Result};
use crate::types::{DownloadInfo, DownloadStatus, RequestId};

use super::ZipDownloader;

impl ZipDownloader {
    /// Cancel a request
    ///
    /// Signals the request's cancellation token and records the `cancelled`
    /// status. In-flight fetches stop at the next chunk boundary and the
    /// archive builder stops before the next entry. Temp files and any partial
    /// destination object are removed by the pipeline as it unwinds.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the request is unknown
    /// - [`Error::InvalidState`] once the request is uploading or has finished;
    ///   an upload in progress always runs to completion
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use zip_dl::*;
    /// # async fn example(downloader: ZipDownloader, id: RequestId) -> Result<()> {
    /// downloader.cancel(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        let current = self.tracker.status(id).await?;
        if !current.can_transition_to(DownloadStatus::Cancelled) {
            return Err(Error::InvalidState {
                id,
                operation: "cancel".to_string(),
                current_state: current,
            });
        }

        if let Some(token) = self.active.tokens.lock().await.get(&id) {
            token.cancel();
        }

        match self.tracker.transition(id, DownloadStatus::Cancelled).await {
            Ok(_) => {
                tracing::info!(request_id = %id, from = %current, "ZIP request cancelled");
                Ok(())
            }
            // The pipeline moved on (e.g. into uploading) before the signal landed
            Err(Error::InvalidTransition { from, .. }) => Err(Error::InvalidState {
                id,
                operation: "cancel".to_string(),
                current_state: from,
            }),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of one request
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the request is unknown or has been purged.
    pub async fn status(&self, id: RequestId) -> Result<DownloadInfo> {
        self.tracker.get(id).await?.ok_or(Error::NotFound(id))
    }

    /// Snapshots of every tracked request, oldest first
    pub async fn list(&self) -> Result<Vec<DownloadInfo>> {
        self.tracker.list().await
    }
}
