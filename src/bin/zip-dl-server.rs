//! ZIP download service
//!
//! Reads its configuration from the environment (`SAS_FUNCTION_URL` is
//! required), serves the REST API and shuts down gracefully on SIGTERM/SIGINT.
//!
//! Log verbosity comes from `RUST_LOG`, then `LOG_LEVEL`, defaulting to `info`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use zip_dl::{Config, ZipDownloader};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::from_env()?;
    let downloader = Arc::new(ZipDownloader::new(config).await?);

    let _services = downloader.start_services();
    let api = downloader.spawn_api_server();

    tokio::select! {
        result = api => {
            match result {
                Ok(Ok(())) => tracing::warn!("API server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
                Err(e) => tracing::error!(error = %e, "API server task panicked"),
            }
            downloader.shutdown().await;
        }
        result = zip_dl::run_with_shutdown((*downloader).clone()) => result?,
    }

    Ok(())
}
