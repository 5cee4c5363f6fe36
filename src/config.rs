//! Configuration types for zip-dl

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::CompressionLevel;

/// Bytes in one GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Request limits enforced before any storage access
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Minimum number of files per archive (default: 1)
    #[serde(default = "default_min_files")]
    pub min_files: usize,

    /// Maximum number of files per archive (default: 25)
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Maximum size of a single file in bytes (default: 1 GiB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Maximum combined size of all files in bytes (default: 5 GiB)
    #[serde(default = "default_max_total_size")]
    pub max_total_size_bytes: u64,

    /// Maximum archive name length in characters (default: 100)
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_files: default_min_files(),
            max_files: default_max_files(),
            max_file_size_bytes: default_max_file_size(),
            max_total_size_bytes: default_max_total_size(),
            max_name_length: default_max_name_length(),
        }
    }
}

/// Pipeline timing, concurrency and memory settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Timeout for fetching one blob, across all retry attempts (default: 300 seconds)
    #[serde(default = "default_blob_timeout", with = "duration_serde")]
    pub blob_timeout: Duration,

    /// Overall deadline for a request, from validation to completion (default: 480 seconds)
    #[serde(default = "default_max_processing_time", with = "duration_serde")]
    pub max_processing_time: Duration,

    /// Maximum concurrent blob fetches across all requests in the process (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Memory ceiling for in-flight buffers in bytes (default: 1.5 GiB)
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: u64,

    /// Streaming chunk size in bytes (default: 8 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Compression level used when a request does not specify one (default: 6)
    #[serde(default)]
    pub default_compression_level: CompressionLevel,

    /// How long completed archives stay downloadable (default: 60 minutes)
    #[serde(default = "default_zip_expiry", with = "duration_serde")]
    pub zip_expiry: Duration,

    /// How long finished request records are kept before being purged (default: 24 hours)
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            blob_timeout: default_blob_timeout(),
            max_processing_time: default_max_processing_time(),
            max_concurrent_downloads: default_max_concurrent(),
            max_memory_bytes: default_max_memory(),
            chunk_size: default_chunk_size(),
            default_compression_level: CompressionLevel::default(),
            zip_expiry: default_zip_expiry(),
            retention: default_retention(),
        }
    }
}

/// Retry configuration for transient storage and network failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 1.5)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// SAS token service integration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SasConfig {
    /// Base URL of the SAS token function app (required for the HTTP client)
    #[serde(default)]
    pub function_url: Option<String>,

    /// Path of the token endpoint (default: "/api/get-blob-sas-token")
    #[serde(default = "default_sas_endpoint_path")]
    pub endpoint_path: String,

    /// Function key sent as `x-functions-key`
    #[serde(default, skip_serializing)]
    pub function_key: Option<String>,

    /// Request timeout for one token call (default: 30 seconds)
    #[serde(default = "default_sas_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Validity requested for source read tokens (default: 60 minutes)
    #[serde(default = "default_sas_expiry", with = "duration_serde")]
    pub token_expiry: Duration,

    /// Whole-phase retries after a token failure (default: 1)
    #[serde(default = "default_sas_phase_retries")]
    pub phase_retries: u32,

    /// Cooldown before a token phase retry (default: 5 seconds)
    #[serde(default = "default_sas_retry_cooldown", with = "duration_serde")]
    pub retry_cooldown: Duration,
}

impl Default for SasConfig {
    fn default() -> Self {
        Self {
            function_url: None,
            endpoint_path: default_sas_endpoint_path(),
            function_key: None,
            timeout: default_sas_timeout(),
            token_expiry: default_sas_expiry(),
            phase_retries: default_sas_phase_retries(),
            retry_cooldown: default_sas_retry_cooldown(),
        }
    }
}

/// Storage locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage account URL (informational, tokens carry full URLs)
    #[serde(default)]
    pub account_url: Option<String>,

    /// Container receiving finished archives (default: "temp-zips")
    #[serde(default = "default_temp_container")]
    pub temp_container: String,

    /// Local directory for spooled blobs and archives (default: system temp dir + "zip-dl")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Connect timeout for storage HTTP calls (default: 30 seconds)
    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            account_url: None,
            temp_container: default_temp_container(),
            temp_dir: default_temp_dir(),
            connect_timeout: default_http_timeout(),
        }
    }
}

/// REST API server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind (default: 127.0.0.1:7071)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins, "*" for any (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

/// Main configuration for ZipDownloader
///
/// Fields are grouped into sub-configs:
/// - [`limits`](LimitsConfig) - request size and count ceilings
/// - [`processing`](ProcessingConfig) - timeouts, concurrency, memory, expiry
/// - [`retry`](RetryConfig) - backoff for storage and network failures
/// - [`sas`](SasConfig) - token service integration
/// - [`storage`](StorageConfig) - destination container and local spool
/// - [`api`](ApiConfig) - REST server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Request limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Pipeline settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// SAS token service
    #[serde(default)]
    pub sas: SasConfig,

    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// REST API
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Build a config from defaults overridden by process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults overridden by `lookup`
    ///
    /// Recognised keys: `MAX_ZIP_FILES`, `MAX_ZIP_SIZE_GB`, `ZIP_EXPIRY_MINUTES`,
    /// `TEMP_ZIP_CONTAINER`, `STORAGE_ACCOUNT_URL`, `SAS_FUNCTION_URL`,
    /// `SAS_FUNCTION_KEY`, `SAS_FUNCTION_TIMEOUT`, `SAS_EXPIRY_MINUTES`,
    /// `ZIP_DL_BIND_ADDRESS`, `ZIP_DL_TEMP_DIR`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = parse_var::<usize>(&lookup, "MAX_ZIP_FILES")? {
            config.limits.max_files = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "MAX_ZIP_SIZE_GB")? {
            config.limits.max_total_size_bytes = scaled("MAX_ZIP_SIZE_GB", v, GIB)?;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "ZIP_EXPIRY_MINUTES")? {
            config.processing.zip_expiry = Duration::from_secs(scaled("ZIP_EXPIRY_MINUTES", v, 60)?);
        }
        if let Some(v) = lookup("TEMP_ZIP_CONTAINER") {
            config.storage.temp_container = v;
        }
        if let Some(v) = lookup("STORAGE_ACCOUNT_URL").filter(|v| !v.is_empty()) {
            config.storage.account_url = Some(v);
        }
        if let Some(v) = lookup("SAS_FUNCTION_URL").filter(|v| !v.is_empty()) {
            config.sas.function_url = Some(v);
        }
        if let Some(v) = lookup("SAS_FUNCTION_KEY").filter(|v| !v.is_empty()) {
            config.sas.function_key = Some(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SAS_FUNCTION_TIMEOUT")? {
            config.sas.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SAS_EXPIRY_MINUTES")? {
            config.sas.token_expiry = Duration::from_secs(scaled("SAS_EXPIRY_MINUTES", v, 60)?);
        }
        if let Some(v) = parse_var::<SocketAddr>(&lookup, "ZIP_DL_BIND_ADDRESS")? {
            config.api.bind_address = v;
        }
        if let Some(v) = lookup("ZIP_DL_TEMP_DIR") {
            config.storage.temp_dir = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are internally consistent
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_files == 0 {
            return Err(Error::config("limits.max_files", "must be at least 1"));
        }
        if limits.min_files > limits.max_files {
            return Err(Error::config(
                "limits.min_files",
                format!(
                    "min_files ({}) exceeds max_files ({})",
                    limits.min_files, limits.max_files
                ),
            ));
        }
        if limits.max_file_size_bytes == 0 || limits.max_total_size_bytes == 0 {
            return Err(Error::config(
                "limits.max_total_size_bytes",
                "size limits must be non-zero",
            ));
        }
        if limits.max_file_size_bytes > limits.max_total_size_bytes {
            return Err(Error::config(
                "limits.max_file_size_bytes",
                "per-file limit exceeds total size limit",
            ));
        }
        if limits.max_name_length == 0 {
            return Err(Error::config("limits.max_name_length", "must be at least 1"));
        }

        let processing = &self.processing;
        if processing.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "processing.max_concurrent_downloads",
                "must be at least 1",
            ));
        }
        if processing.chunk_size == 0 {
            return Err(Error::config("processing.chunk_size", "must be non-zero"));
        }
        // One read buffer and one write buffer per in-flight fetch
        let buffers = (processing.max_concurrent_downloads as u64)
            .saturating_mul(processing.chunk_size as u64)
            .saturating_mul(2);
        if buffers > processing.max_memory_bytes {
            return Err(Error::config(
                "processing.max_memory_bytes",
                format!(
                    "{} concurrent fetches with {}-byte chunks need {} bytes, ceiling is {}",
                    processing.max_concurrent_downloads,
                    processing.chunk_size,
                    buffers,
                    processing.max_memory_bytes
                ),
            ));
        }
        if processing.blob_timeout.is_zero() || processing.max_processing_time.is_zero() {
            return Err(Error::config(
                "processing.max_processing_time",
                "timeouts must be non-zero",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts", "must be at least 1"));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "must be a finite number of at least 1.0",
            ));
        }

        if self.storage.temp_container.trim().is_empty() {
            return Err(Error::config(
                "storage.temp_container",
                "container name must not be empty",
            ));
        }

        Ok(())
    }
}

/// Convert an environment value into base units, rejecting overflow
fn scaled(key: &str, value: u64, unit: u64) -> Result<u64> {
    value
        .checked_mul(unit)
        .ok_or_else(|| Error::config(key, format!("{value} is too large")))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(key, format!("invalid value {raw:?}: {e}"))),
    }
}

fn default_min_files() -> usize {
    1
}

fn default_max_files() -> usize {
    25
}

fn default_max_file_size() -> u64 {
    GIB
}

fn default_max_total_size() -> u64 {
    5 * GIB
}

fn default_max_name_length() -> usize {
    100
}

fn default_blob_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_processing_time() -> Duration {
    Duration::from_secs(480)
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_memory() -> u64 {
    GIB + GIB / 2
}

fn default_chunk_size() -> usize {
    8192
}

fn default_zip_expiry() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_sas_endpoint_path() -> String {
    "/api/get-blob-sas-token".to_string()
}

fn default_sas_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sas_expiry() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_sas_phase_retries() -> u32 {
    1
}

fn default_sas_retry_cooldown() -> Duration {
    Duration::from_secs(5)
}

fn default_temp_container() -> String {
    "temp-zips".to_string()
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("zip-dl")
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7071))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
