//! Request limit policy
//!
//! Pure checks run before any storage access. Checks are applied in a fixed
//! order and the first violation wins:
//!
//! 1. file count within `[min_files, max_files]`
//! 2. every declared blob size within the per-file cap
//! 3. the sum of declared sizes within the total cap
//! 4. archive name non-empty, short enough, free of separators and control characters
//! 5. blob paths non-empty and unique

use std::collections::HashSet;

use crate::config::LimitsConfig;
use crate::error::{DownloadError, DownloadErrorKind};
use crate::types::DownloadRequest;

/// Validate a request against the configured limits
pub fn validate(request: &DownloadRequest, limits: &LimitsConfig) -> Result<(), DownloadError> {
    check_file_count(request.blobs.len(), limits)?;

    for blob in &request.blobs {
        if blob.size > limits.max_file_size_bytes {
            return Err(DownloadError::new(
                DownloadErrorKind::SizeLimitExceeded,
                format!(
                    "{} is {} bytes, per-file limit is {} bytes",
                    blob.path, blob.size, limits.max_file_size_bytes
                ),
            )
            .with_blob(blob));
        }
    }

    let total = request
        .blobs
        .iter()
        .fold(0u64, |acc, blob| acc.saturating_add(blob.size));
    if total > limits.max_total_size_bytes {
        return Err(DownloadError::new(
            DownloadErrorKind::SizeLimitExceeded,
            format!(
                "requested {} bytes in total, limit is {} bytes",
                total, limits.max_total_size_bytes
            ),
        ));
    }

    check_archive_name(&request.archive_name, limits)?;

    let mut seen = HashSet::with_capacity(request.blobs.len());
    for blob in &request.blobs {
        if blob.entry_name().trim().is_empty() {
            return Err(DownloadError::validation("blob path must not be empty").with_blob(blob));
        }
        if !seen.insert(blob.entry_name()) {
            return Err(DownloadError::validation(format!(
                "blob {} is listed more than once",
                blob.path
            ))
            .with_blob(blob));
        }
    }

    Ok(())
}

fn check_file_count(count: usize, limits: &LimitsConfig) -> Result<(), DownloadError> {
    if count < limits.min_files {
        return Err(DownloadError::new(
            DownloadErrorKind::CountLimitExceeded,
            format!(
                "{count} files requested, at least {} required",
                limits.min_files
            ),
        ));
    }
    if count > limits.max_files {
        return Err(DownloadError::new(
            DownloadErrorKind::CountLimitExceeded,
            format!("{count} files requested, at most {} allowed", limits.max_files),
        ));
    }
    Ok(())
}

fn check_archive_name(name: &str, limits: &LimitsConfig) -> Result<(), DownloadError> {
    if name.trim().is_empty() {
        return Err(DownloadError::validation("archive name must not be empty"));
    }

    let length = name.chars().count();
    if length > limits.max_name_length {
        return Err(DownloadError::validation(format!(
            "archive name is {length} characters, at most {} allowed",
            limits.max_name_length
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| *c == '/' || *c == '\\' || c.is_control())
    {
        return Err(DownloadError::validation(format!(
            "archive name contains invalid character {bad:?}"
        )));
    }

    Ok(())
}
