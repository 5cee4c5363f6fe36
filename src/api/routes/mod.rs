//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`downloads`] - ZIP request submission, inspection and cancellation
//! - [`system`] - Health and the event stream

use serde::{Deserialize, Serialize};

use crate::types::{DownloadStatus, RequestId};

mod downloads;
mod system;

pub use downloads::*;
pub use system::*;

/// Response body for POST /api/download-zip and DELETE /api/download-zip/:id
#[derive(Debug, Deserialize, Serialize)]
pub struct RequestAccepted {
    /// The request the call acted on
    pub request_id: RequestId,
    /// Status right after the call
    pub status: DownloadStatus,
}
