//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use bulkcast_core::CampaignEngine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, health, metrics};

/// Shared handler state
pub struct AppState {
    pub engine: Arc<CampaignEngine>,
}

/// Create the API router
pub fn create_router(engine: Arc<CampaignEngine>) -> Router {
    let state = Arc::new(AppState { engine });

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness));

    let campaign_routes = Router::new()
        .route("/", post(campaigns::create_campaign))
        .route("/:campaign_id", get(campaigns::get_campaign))
        .route("/:campaign_id/start", post(campaigns::start_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign))
        .route("/:campaign_id/stats", get(campaigns::get_campaign_stats))
        .route(
            "/:campaign_id/recipients/:recipient_id/attempts",
            get(campaigns::list_recipient_attempts),
        );

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1/campaigns", campaign_routes)
        .route("/metrics", get(metrics::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
