//! # zip-dl
//!
//! Bounded, fault-tolerant multi-blob ZIP assembly with signed-URL delivery.
//!
//! A request names up to 25 blobs in object storage. The service checks it
//! against the configured limits, obtains signed read URLs, fetches the blobs
//! with bounded concurrency, streams them into a ZIP archive in request order,
//! uploads the archive and hands back a time-limited signed download URL.
//! Every request moves through an explicit status machine owned by a single
//! tracker task, and completed archives expire on their own.
//!
//! ## Quick Start
//!
//! ```no_run
//! use zip_dl::{BlobReference, Config, ZipDownloader, ZipRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = ZipDownloader::new(Config::from_env()?).await?;
//!     downloader.start_services();
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let id = downloader
//!         .submit(ZipRequest {
//!             archive_name: "reports".to_string(),
//!             blobs: vec![BlobReference::new("uploads/q1.csv", 2048)],
//!             compression_level: None,
//!         })
//!         .await?;
//!     println!("{:?}", downloader.status(id).await?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Streaming ZIP archive builder
pub mod archive;
/// Configuration types
pub mod config;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Bounded, retrying blob fetcher
pub mod fetcher;
/// Request status tracking
pub mod lifecycle;
/// Request limit checks
pub mod limits;
/// Retry logic with exponential backoff
pub mod retry;
/// Signed URL issuance
pub mod sas;
/// Blob storage access
pub mod storage;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use downloader::ZipDownloader;
pub use error::{
    ApiError, DownloadError, DownloadErrorKind, Error, ErrorDetail, PipelineError, Result,
    ToHttpStatus,
};
pub use sas::{HttpSasClient, SasTokenProvider};
pub use storage::{BlobStore, HttpBlobStore};
pub use types::{
    AccessType, ArchiveResult, BlobReference, CompressionLevel, DownloadInfo, DownloadStatus,
    Event, RequestId, SasToken, ZipRequest,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use zip_dl::{Config, ZipDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::from_env()?;
///     let downloader = ZipDownloader::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(downloader).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: ZipDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
