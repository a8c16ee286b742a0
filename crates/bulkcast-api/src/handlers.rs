//! API request handlers

pub mod campaigns;
pub mod health;
pub mod metrics;

use axum::{http::StatusCode, Json};
use bulkcast_core::CampaignError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an engine error to its HTTP status and error body
pub fn api_error(e: CampaignError) -> ApiError {
    let err: bulkcast_common::Error = e.into();
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        error!("Request failed: {}", err);
    }

    (
        status,
        Json(ErrorResponse {
            error: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}
