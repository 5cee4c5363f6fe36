//! Graceful shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::types::Event;

use super::ZipDownloader;

/// How long shutdown waits for cancelled pipelines to unwind
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl ZipDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new requests
    /// 2. Cancels all active requests (uploads already underway still finish)
    /// 3. Waits up to 30 seconds for the pipelines to clean up
    /// 4. Stops the expiry janitor and retention sweeper
    /// 5. Emits [`Event::Shutdown`]
    pub async fn shutdown(&self) {
        tracing::info!("Initiating graceful shutdown");

        self.active.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new requests");

        self.cancel_all_active().await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_active_requests()).await {
            Ok(()) => tracing::info!("All active requests finished"),
            Err(_) => tracing::warn!(
                "Timeout waiting for requests to finish, proceeding with shutdown"
            ),
        }

        self.services_token.cancel();
        self.emit_event(Event::Shutdown);

        tracing::info!("Graceful shutdown complete");
    }

    async fn cancel_all_active(&self) {
        let active = self.active.tokens.lock().await;
        tracing::debug!(active_count = active.len(), "Cancelling all active requests");

        for (id, token) in active.iter() {
            tracing::debug!(request_id = %id, "Signaling cancellation");
            token.cancel();
        }
    }

    async fn wait_for_active_requests(&self) {
        loop {
            let active_count = self.active.tokens.lock().await.len();
            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "Waiting for active requests to finish");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
