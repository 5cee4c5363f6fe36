//! SAS token service client
//!
//! Signed URLs are issued by an external function app. The pipeline only sees
//! the [`SasTokenProvider`] trait; [`HttpSasClient`] is the production
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SasConfig;
use crate::error::{DownloadError, Error, Result};
use crate::types::{AccessType, SasToken};

/// Issues signed, time-limited URLs for blobs
#[async_trait]
pub trait SasTokenProvider: Send + Sync {
    /// Request a signed URL for `blob_path` valid for at least `validity`
    ///
    /// Every failure is reported as `sas_service_error`; implementations do not retry.
    async fn request_token(
        &self,
        blob_path: &str,
        access: AccessType,
        validity: Duration,
    ) -> std::result::Result<SasToken, DownloadError>;
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    blob_path: &'a str,
    access_type: AccessType,
    expiry_minutes: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    sas_url: String,
    expires_at: DateTime<Utc>,
}

/// HTTP client for the SAS token function app
#[derive(Clone, Debug)]
pub struct HttpSasClient {
    client: reqwest::Client,
    endpoint: String,
    function_key: Option<String>,
    timeout: Duration,
}

impl HttpSasClient {
    /// Build a client from configuration
    ///
    /// Fails when no function URL is configured.
    pub fn from_config(config: &SasConfig) -> Result<Self> {
        let base = config
            .function_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::config("sas.function_url", "SAS_FUNCTION_URL must be set")
            })?;

        let endpoint = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            config.endpoint_path.trim_start_matches('/')
        );
        url::Url::parse(&endpoint).map_err(|e| {
            Error::config("sas.function_url", format!("invalid URL {endpoint:?}: {e}"))
        })?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("zip-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            function_key: config.function_key.clone(),
            timeout: config.timeout,
        })
    }

    /// Full URL of the token endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(
        &self,
        blob_path: &str,
        access: AccessType,
        validity: Duration,
    ) -> std::result::Result<SasToken, DownloadError> {
        let body = TokenRequest {
            blob_path,
            access_type: access,
            expiry_minutes: validity.as_secs().div_ceil(60).max(1),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.function_key {
            request = request.header("x-functions-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::sas_service(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DownloadError::sas_service(format!(
                "token service returned {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DownloadError::sas_service(format!("malformed token response: {e}")))?;

        if url::Url::parse(&token.sas_url).is_err() {
            return Err(DownloadError::sas_service(
                "token service returned an invalid URL",
            ));
        }

        Ok(SasToken {
            url: token.sas_url,
            expires_at: token.expires_at,
        })
    }
}

#[async_trait]
impl SasTokenProvider for HttpSasClient {
    async fn request_token(
        &self,
        blob_path: &str,
        access: AccessType,
        validity: Duration,
    ) -> std::result::Result<SasToken, DownloadError> {
        tracing::debug!(blob = blob_path, access = %access, "Requesting SAS token");

        match tokio::time::timeout(self.timeout, self.call(blob_path, access, validity)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::warn!(blob = blob_path, error = %e, "SAS token request failed");
                }
                result
            }
            Err(_) => {
                tracing::warn!(
                    blob = blob_path,
                    timeout_secs = self.timeout.as_secs(),
                    "SAS token request timed out"
                );
                Err(DownloadError::sas_service(format!(
                    "token request timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
