//! Core downloader implementation split into focused submodules.
//!
//! The `ZipDownloader` struct and its methods are organized by domain:
//! - [`submit`] - Request intake and validation
//! - [`pipeline`] - Token acquisition, fetch, archive and upload for one request
//! - [`control`] - Status queries and cancellation
//! - [`shutdown`] - Graceful shutdown
//! - [`services`] - Expiry janitor and retention sweeper

mod control;
mod pipeline;
mod services;
mod shutdown;
mod submit;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::BlobFetcher;
use crate::lifecycle::LifecycleTracker;
use crate::sas::{HttpSasClient, SasTokenProvider};
use crate::storage::{BlobStore, HttpBlobStore};
use crate::types::{Event, RequestId};

/// Event channel capacity; slower subscribers see `Lagged`
const EVENT_BUFFER: usize = 1000;

/// Running requests and the cancellation token for each
#[derive(Clone, Default)]
pub(crate) struct ActiveRequests {
    /// Map of running requests to their cancellation tokens
    pub(crate) tokens: Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
    /// Set to false during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct ZipDownloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Owner of every request record
    pub(crate) tracker: LifecycleTracker,
    /// Signed URL issuer
    pub(crate) sas: Arc<dyn SasTokenProvider>,
    /// Object storage
    pub(crate) store: Arc<dyn BlobStore>,
    /// Bounded blob fetcher shared by every request
    pub(crate) fetcher: BlobFetcher,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Running request state
    pub(crate) active: ActiveRequests,
    /// Stops background services on shutdown
    pub(crate) services_token: CancellationToken,
}

impl ZipDownloader {
    /// Create a downloader talking to the configured SAS function and storage over HTTP
    ///
    /// Validates the configuration, requires `sas.function_url`, and creates the
    /// local temp directory.
    pub async fn new(config: Config) -> Result<Self> {
        let sas = HttpSasClient::from_config(&config.sas)?;
        let store = HttpBlobStore::new(config.storage.connect_timeout)?;
        Self::with_collaborators(config, Arc::new(sas), Arc::new(store)).await
    }

    /// Create a downloader with caller-supplied token provider and blob store
    pub async fn with_collaborators(
        config: Config,
        sas: Arc<dyn SasTokenProvider>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.temp_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create temp directory '{}': {}",
                        config.storage.temp_dir.display(),
                        e
                    ),
                ))
            })?;

        let (event_tx, _rx) = broadcast::channel(EVENT_BUFFER);
        let tracker = LifecycleTracker::spawn(event_tx.clone(), config.processing.zip_expiry);
        let fetcher = BlobFetcher::new(store.clone(), &config);

        let active = ActiveRequests {
            tokens: Arc::default(),
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        tracing::info!(
            max_files = config.limits.max_files,
            max_concurrent = config.processing.max_concurrent_downloads,
            temp_container = %config.storage.temp_container,
            "ZIP downloader initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            tracker,
            sas,
            store,
            fetcher,
            event_tx,
            active,
            services_token: CancellationToken::new(),
        })
    }

    /// Subscribe to request events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls more than 1000 events behind receives `RecvError::Lagged`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use zip_dl::{Config, ZipDownloader};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let downloader = ZipDownloader::new(Config::from_env()?).await?;
    ///
    ///     let mut events = downloader.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             tracing::info!(?event, "zip event");
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers
    ///
    /// With no subscribers the event is dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Local working directory for one request
    pub(crate) fn work_dir(&self, id: RequestId) -> PathBuf {
        self.config.storage.temp_dir.join(format!("download_{id}"))
    }

    /// Spawn the REST API server in a background task
    pub fn spawn_api_server(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let downloader = self.clone();
        let config = self.config.clone();

        tokio::spawn(async move { crate::api::start_api_server(downloader, config).await })
    }
}
