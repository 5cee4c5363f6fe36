//! ZIP request handlers.

use super::RequestAccepted;
use crate::api::AppState;
use crate::error::{ApiError, Error};
use crate::types::{DownloadStatus, RequestId, ZipRequest};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// POST /api/download-zip - Submit a ZIP request
///
/// Returns 202 with the new request id. Limit violations are recorded on the
/// request and returned with the status mapped from their kind.
pub async fn submit_zip(State(state): State<AppState>, Json(request): Json<ZipRequest>) -> Response {
    let request_id = match state.downloader.submit(request).await {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    // The pipeline may already have moved past validation
    let status = state
        .downloader
        .status(request_id)
        .await
        .map(|info| info.status)
        .unwrap_or(DownloadStatus::Processing);

    (
        StatusCode::ACCEPTED,
        Json(RequestAccepted { request_id, status }),
    )
        .into_response()
}

/// GET /api/download-zip - List tracked requests, oldest first
pub async fn list_requests(State(state): State<AppState>) -> Response {
    match state.downloader.list().await {
        Ok(requests) => (StatusCode::OK, Json(requests)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list requests");
            e.into_response()
        }
    }
}

/// GET /api/download-zip/:id - Inspect one request
pub async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.downloader.status(id).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/download-zip/:id - Cancel a request
///
/// 409 once the request is uploading or finished.
pub async fn cancel_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.downloader.cancel(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RequestAccepted {
                request_id: id,
                status: DownloadStatus::Cancelled,
            }),
        )
            .into_response(),
        Err(e @ Error::InvalidState { .. }) => {
            tracing::debug!(request_id = %id, error = %e, "Cancel rejected");
            e.into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn parse_id(raw: &str) -> Result<RequestId, Response> {
    raw.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation(format!("invalid request id: {raw}"))),
        )
            .into_response()
    })
}
