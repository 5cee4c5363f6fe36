//! Background services: expired archive janitor and terminal record sweeper.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::types::{AccessType, Event};

use super::ZipDownloader;

impl ZipDownloader {
    /// Start every background service
    pub fn start_services(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![self.start_expiry_janitor(), self.start_retention_sweeper()]
    }

    /// Start the task that deletes archives once their request expires
    ///
    /// Deletion is best effort: failures are logged and the request stays expired.
    pub fn start_expiry_janitor(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.subscribe();
        let stop = self.services_token.clone();
        let downloader = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(Event::Expired { id, destination }) => {
                        if let Err(e) = downloader.delete_destination(&destination).await {
                            tracing::warn!(
                                request_id = %id,
                                destination = %destination,
                                error = %e,
                                "Failed to delete expired archive"
                            );
                        } else {
                            tracing::info!(
                                request_id = %id,
                                destination = %destination,
                                "Expired archive deleted"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Expiry janitor lagged behind the event stream");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Expiry janitor stopped");
        });

        tracing::info!("Expiry janitor background task started");

        handle
    }

    /// Start the task that purges old failed, cancelled and expired records
    pub fn start_retention_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let retention = self.config.processing.retention;
        let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(3600));
        let stop = self.services_token.clone();
        let tracker = self.tracker.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match tracker.purge_terminal(retention).await {
                    Ok(purged) if !purged.is_empty() => {
                        tracing::info!(purged = purged.len(), "Purged finished requests");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Retention sweep failed");
                        break;
                    }
                }
            }
            tracing::debug!("Retention sweeper stopped");
        });

        tracing::info!(
            retention_secs = retention.as_secs(),
            period_secs = period.as_secs(),
            "Retention sweeper background task started"
        );

        handle
    }

    async fn delete_destination(&self, destination: &str) -> Result<(), crate::error::DownloadError> {
        let token = self
            .sas
            .request_token(destination, AccessType::ReadWrite, self.config.sas.token_expiry)
            .await?;
        self.store.delete(&token.url).await
    }
}
