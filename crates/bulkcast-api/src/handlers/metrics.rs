//! Prometheus metrics endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::routes::AppState;

/// Engine metrics in the Prometheus text format
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.metrics().render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
