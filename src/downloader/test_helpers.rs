//! In-memory collaborators and a ready-made `ZipDownloader` for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tempfile::TempDir;

use crate::config::Config;
use crate::downloader::ZipDownloader;
use crate::error::DownloadError;
use crate::sas::SasTokenProvider;
use crate::storage::{BlobStore, BlobStream};
use crate::types::{AccessType, SasToken};

const URL_PREFIX: &str = "memory://store/";

/// Chunk size used when streaming stored blobs back
const READ_CHUNK: usize = 8;

#[derive(Default)]
struct StoreState {
    blobs: HashMap<String, Vec<u8>>,
    read_failures: HashMap<String, (DownloadError, usize)>,
    read_attempts: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    uploads: HashMap<String, Vec<u8>>,
    upload_failures: Option<(DownloadError, usize)>,
    upload_attempts: usize,
    upload_delay: Option<Duration>,
    deleted: Vec<String>,
}

/// Blob store keeping everything in memory, addressed by `memory://store/{path}` URLs
#[derive(Default)]
pub(crate) struct MemoryBlobStore {
    state: Mutex<StoreState>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// URL addressing `path`; any query string is ignored on access
    pub(crate) fn url_for(path: &str) -> String {
        format!("{URL_PREFIX}{}", path.trim_start_matches('/'))
    }

    fn path_of(url: &str) -> String {
        let without_query = url.split('?').next().unwrap_or_default();
        without_query
            .strip_prefix(URL_PREFIX)
            .unwrap_or(without_query)
            .to_string()
    }

    pub(crate) fn put(&self, path: &str, data: &[u8]) {
        let key = Self::path_of(&Self::url_for(path));
        self.state.lock().unwrap().blobs.insert(key, data.to_vec());
    }

    /// Fail the next `times` reads of `path` with `error`
    pub(crate) fn fail_next(&self, path: &str, error: DownloadError, times: usize) {
        let key = Self::path_of(&Self::url_for(path));
        self.state
            .lock()
            .unwrap()
            .read_failures
            .insert(key, (error, times));
    }

    /// Delay every read of `path` before the stream is returned
    pub(crate) fn set_delay(&self, path: &str, delay: Duration) {
        let key = Self::path_of(&Self::url_for(path));
        self.state.lock().unwrap().delays.insert(key, delay);
    }

    pub(crate) fn read_attempts(&self, path: &str) -> usize {
        let key = Self::path_of(&Self::url_for(path));
        self.state
            .lock()
            .unwrap()
            .read_attempts
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of reads open at the same time
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_uploads(&self, error: DownloadError, times: usize) {
        self.state.lock().unwrap().upload_failures = Some((error, times));
    }

    pub(crate) fn set_upload_delay(&self, delay: Duration) {
        self.state.lock().unwrap().upload_delay = Some(delay);
    }

    pub(crate) fn upload_attempts(&self) -> usize {
        self.state.lock().unwrap().upload_attempts
    }

    pub(crate) fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        let key = Self::path_of(&Self::url_for(path));
        self.state.lock().unwrap().uploads.get(&key).cloned()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_read(&self, url: &str) -> Result<BlobStream, DownloadError> {
        let path = Self::path_of(url);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());

        let delay = {
            let mut state = self.state.lock().unwrap();
            *state.read_attempts.entry(path.clone()).or_default() += 1;
            state.delays.get(&path).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = {
            let mut state = self.state.lock().unwrap();
            if let Some((error, remaining)) = state.read_failures.get_mut(&path)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(error.clone());
            }
            state.blobs.get(&path).cloned()
        };
        let Some(data) = data else {
            return Err(DownloadError::new(
                crate::error::DownloadErrorKind::FileNotFound,
                format!("{path} does not exist"),
            ));
        };

        let chunks: Vec<Result<Bytes, DownloadError>> = data
            .chunks(READ_CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks)
            .map(move |chunk| {
                let _held = &guard;
                chunk
            })
            .boxed())
    }

    async fn upload_file(
        &self,
        url: &str,
        path: &Path,
        size: u64,
        _chunk_size: usize,
    ) -> Result<(), DownloadError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.upload_attempts += 1;
            if let Some((error, remaining)) = state.upload_failures.as_mut()
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(error.clone());
            }
            state.upload_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = tokio::fs::read(path).await.unwrap();
        assert_eq!(data.len() as u64, size, "declared upload size");
        self.state
            .lock()
            .unwrap()
            .uploads
            .insert(Self::path_of(url), data);
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<(), DownloadError> {
        let path = Self::path_of(url);
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(&path);
        state.deleted.push(path);
        Ok(())
    }
}

/// Token provider issuing `memory://` URLs without any network
#[derive(Default)]
pub(crate) struct StaticSasProvider {
    failures: Mutex<Option<(DownloadError, usize)>>,
    requests: Mutex<Vec<(String, AccessType)>>,
}

impl StaticSasProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` token requests with `error`
    pub(crate) fn fail_next(&self, error: DownloadError, times: usize) {
        *self.failures.lock().unwrap() = Some((error, times));
    }

    /// Every request received, in order
    pub(crate) fn requests(&self) -> Vec<(String, AccessType)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SasTokenProvider for StaticSasProvider {
    async fn request_token(
        &self,
        blob_path: &str,
        access: AccessType,
        validity: Duration,
    ) -> Result<SasToken, DownloadError> {
        self.requests
            .lock()
            .unwrap()
            .push((blob_path.to_string(), access));

        if let Some((error, remaining)) = self.failures.lock().unwrap().as_mut()
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(error.clone());
        }

        Ok(SasToken {
            url: format!(
                "{}?sp={}",
                MemoryBlobStore::url_for(blob_path),
                access.permissions()
            ),
            expires_at: chrono::Utc::now() + chrono::Duration::from_std(validity).unwrap(),
        })
    }
}

/// Config suited to tests: short retry delays, small chunks, temp dir under `root`
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.temp_dir = root.join("spool");
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.sas.retry_cooldown = Duration::from_millis(10);
    config.processing.chunk_size = 64;
    config
}

/// Helper to create a test ZipDownloader backed by in-memory collaborators.
/// Returns the downloader, the tempdir (which must be kept alive), the store and the token provider.
pub(crate) async fn create_test_downloader() -> (
    ZipDownloader,
    TempDir,
    Arc<MemoryBlobStore>,
    Arc<StaticSasProvider>,
) {
    let temp_dir = tempfile::tempdir().unwrap();
    create_test_downloader_with(test_config(temp_dir.path()), temp_dir).await
}

/// Same as [`create_test_downloader`] with a caller-adjusted config
pub(crate) async fn create_test_downloader_with(
    config: Config,
    temp_dir: TempDir,
) -> (
    ZipDownloader,
    TempDir,
    Arc<MemoryBlobStore>,
    Arc<StaticSasProvider>,
) {
    let store = Arc::new(MemoryBlobStore::new());
    let sas = Arc::new(StaticSasProvider::new());
    let downloader = ZipDownloader::with_collaborators(config, sas.clone(), store.clone())
        .await
        .unwrap();
    (downloader, temp_dir, store, sas)
}
