//! Core types for zip-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// Unique identifier for a ZIP download request
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    /// Generate a fresh random RequestId
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A stored object requested for inclusion in the archive
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobReference {
    /// Storage path, `container/dir/name`
    pub path: String,
    /// Declared size in bytes
    pub size: u64,
    /// Optional hex SHA-256 of the blob contents, verified after fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl BlobReference {
    /// Create a reference without a content hash
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            content_hash: None,
        }
    }

    /// Attach an expected SHA-256 (hex)
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Name of this blob's entry inside the archive
    pub fn entry_name(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Lifecycle status of a ZIP download request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Submitted, not yet picked up
    Pending,
    /// Limit policy running
    Validating,
    /// Acquiring access tokens
    Processing,
    /// Fetching blobs
    Downloading,
    /// Building the archive
    Compressing,
    /// Uploading the archive to its destination
    Uploading,
    /// Archive available at its signed URL
    Completed,
    /// Ended with an error
    Failed,
    /// Archive link lapsed after completion
    Expired,
    /// Stopped by the caller
    Cancelled,
}

impl DownloadStatus {
    /// Every status, in lifecycle order
    pub const ALL: [DownloadStatus; 10] = [
        DownloadStatus::Pending,
        DownloadStatus::Validating,
        DownloadStatus::Processing,
        DownloadStatus::Downloading,
        DownloadStatus::Compressing,
        DownloadStatus::Uploading,
        DownloadStatus::Completed,
        DownloadStatus::Failed,
        DownloadStatus::Expired,
        DownloadStatus::Cancelled,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Validating => "validating",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Compressing => "compressing",
            DownloadStatus::Uploading => "uploading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Expired => "expired",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from this one in a single step
    pub fn allowed_transitions(&self) -> &'static [DownloadStatus] {
        use DownloadStatus::*;
        match self {
            Pending => &[Validating, Failed, Cancelled],
            Validating => &[Processing, Failed, Cancelled],
            Processing => &[Downloading, Failed, Cancelled],
            Downloading => &[Compressing, Failed, Cancelled],
            Compressing => &[Uploading, Failed, Cancelled],
            Uploading => &[Completed, Failed],
            Completed => &[Expired],
            Failed | Expired | Cancelled => &[],
        }
    }

    /// Whether `target` is an allowed next status
    pub fn can_transition_to(&self, target: DownloadStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// No outgoing transitions at all
    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// The pipeline is no longer running for this request
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Failed
                | DownloadStatus::Expired
                | DownloadStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown download status: {s}"))
    }
}

/// ZIP compression level, 0 (store) through 9 (maximum)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// Store entries uncompressed
    pub const NONE: CompressionLevel = CompressionLevel(0);
    /// Fastest deflate
    pub const FASTEST: CompressionLevel = CompressionLevel(1);
    /// Fast deflate
    pub const FAST: CompressionLevel = CompressionLevel(3);
    /// Balanced default
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);
    /// Smallest output
    pub const MAXIMUM: CompressionLevel = CompressionLevel(9);

    /// Create a level, rejecting values above 9
    pub fn new(level: u8) -> Option<Self> {
        (level <= 9).then_some(Self(level))
    }

    /// Numeric level
    pub fn get(&self) -> u8 {
        self.0
    }

    /// Level 0 writes entries without compression
    pub fn is_stored(&self) -> bool {
        self.0 == 0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| format!("compression level must be 0-9, got {level}"))
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> Self {
        level.0
    }
}

/// Access scope requested for a SAS token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    /// Read the blob
    Read,
    /// Create or overwrite the blob
    Write,
    /// Both
    ReadWrite,
}

impl AccessType {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Read => "READ",
            AccessType::Write => "WRITE",
            AccessType::ReadWrite => "READ_WRITE",
        }
    }

    /// Storage permission letters for this access type
    pub fn permissions(&self) -> &'static str {
        match self {
            AccessType::Read => "r",
            AccessType::Write => "w",
            AccessType::ReadWrite => "rw",
        }
    }
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed, time-limited URL for one blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SasToken {
    /// Signed URL
    pub url: String,
    /// When the signature stops being accepted
    pub expires_at: DateTime<Utc>,
}

/// Inbound request to build a ZIP archive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZipRequest {
    /// File name for the archive (`.zip` appended when missing)
    pub archive_name: String,
    /// Blobs to include, in archive order
    pub blobs: Vec<BlobReference>,
    /// Compression level, the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<CompressionLevel>,
}

/// A submitted request as owned by the service
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Request identifier
    pub id: RequestId,
    /// Archive file name as submitted
    pub archive_name: String,
    /// Blobs in archive order
    pub blobs: Vec<BlobReference>,
    /// Compression level for every entry
    pub compression_level: CompressionLevel,
    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl DownloadRequest {
    /// Assign an id and timestamp to an inbound request
    pub fn from_submission(request: ZipRequest, default_level: CompressionLevel) -> Self {
        Self {
            id: RequestId::new(),
            archive_name: request.archive_name,
            blobs: request.blobs,
            compression_level: request.compression_level.unwrap_or(default_level),
            created_at: Utc::now(),
        }
    }

    /// Sum of declared blob sizes
    pub fn total_size(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }

    /// Destination blob path for the finished archive
    pub fn destination_path(&self, container: &str) -> String {
        let name = self.archive_name.trim();
        let suffix = if name.to_ascii_lowercase().ends_with(".zip") {
            ""
        } else {
            ".zip"
        };
        format!(
            "{}/download_{}/{}{}",
            container.trim_end_matches('/'),
            self.id,
            name,
            suffix
        )
    }
}

/// Where the finished archive lives and how to fetch it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveResult {
    /// Destination blob path
    pub destination: String,
    /// Signed download URL
    pub url: String,
    /// When the download URL stops working
    pub expires_at: DateTime<Utc>,
    /// Archive size in bytes
    pub size_bytes: u64,
    /// Number of entries written
    pub entry_count: usize,
}

/// One recorded status change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status entered
    pub status: DownloadStatus,
    /// When it was entered
    pub at: DateTime<Utc>,
}

/// Snapshot of a request for callers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadInfo {
    /// Request identifier
    pub id: RequestId,
    /// Archive name as submitted
    pub archive_name: String,
    /// Current status
    pub status: DownloadStatus,
    /// Number of requested blobs
    pub file_count: usize,
    /// Sum of declared blob sizes
    pub total_bytes: u64,
    /// Requested compression level
    pub compression_level: CompressionLevel,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Time of the latest status change
    pub updated_at: DateTime<Utc>,
    /// Completion time, once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the completed archive expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Failure that ended the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DownloadError>,
    /// Finished archive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ArchiveResult>,
    /// Every status entered, oldest first
    pub history: Vec<StatusChange>,
}

/// Event emitted during a request's lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Request accepted
    Submitted {
        /// Request ID
        id: RequestId,
        /// Archive name
        archive_name: String,
        /// Number of blobs requested
        file_count: usize,
    },

    /// Any accepted status transition
    StatusChanged {
        /// Request ID
        id: RequestId,
        /// Previous status
        from: DownloadStatus,
        /// New status
        to: DownloadStatus,
    },

    /// Archive uploaded and signed
    Completed {
        /// Request ID
        id: RequestId,
        /// Signed download URL
        url: String,
        /// URL expiry
        expires_at: DateTime<Utc>,
    },

    /// Request failed
    Failed {
        /// Request ID
        id: RequestId,
        /// The failure
        error: DownloadError,
    },

    /// Request cancelled
    Cancelled {
        /// Request ID
        id: RequestId,
    },

    /// Completed archive expired
    Expired {
        /// Request ID
        id: RequestId,
        /// Destination blob path of the expired archive
        destination: String,
    },

    /// Service shutting down
    Shutdown,
}

impl Event {
    /// Short event name, used as the SSE event type
    pub fn name(&self) -> &'static str {
        match self {
            Event::Submitted { .. } => "submitted",
            Event::StatusChanged { .. } => "status_changed",
            Event::Completed { .. } => "completed",
            Event::Failed { .. } => "failed",
            Event::Cancelled { .. } => "cancelled",
            Event::Expired { .. } => "expired",
            Event::Shutdown => "shutdown",
        }
    }
}
