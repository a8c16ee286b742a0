//! Campaign handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bulkcast_storage::models::{
    Campaign, CampaignState, CampaignStats, CampaignType, DeliveryAttempt, NewCampaign, Recipient,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{api_error, ApiError};
use crate::routes::AppState;

/// Recipient entry of a create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRequest {
    pub address: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Request body for creating a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub campaign_type: CampaignType,
    pub template: String,
    pub batch_size: i32,
    #[serde(default)]
    pub interval_secs: i64,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default = "default_true")]
    pub dedupe: bool,
    #[serde(default = "default_true")]
    pub track_delivery: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recipients: Vec<RecipientRequest>,
}

fn default_true() -> bool {
    true
}

/// Campaign created response
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCampaignResponse {
    #[serde(flatten)]
    pub campaign: Campaign,
    /// Identifiers assigned to the recipients, in request order
    pub recipient_ids: Vec<Uuid>,
}

/// Lifecycle command response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignStateResponse {
    pub id: Uuid,
    pub state: CampaignState,
}

/// Attempt history response
#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptListResponse {
    pub data: Vec<DeliveryAttempt>,
}

/// Create a draft campaign with its recipients
///
/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CreateCampaignResponse>), ApiError> {
    let recipients: Vec<Recipient> = input
        .recipients
        .into_iter()
        .map(|r| Recipient {
            id: Uuid::new_v4(),
            address: r.address,
            variables: r.variables,
        })
        .collect();
    let recipient_ids = recipients.iter().map(|r| r.id).collect();

    let new = NewCampaign {
        name: input.name,
        campaign_type: input.campaign_type,
        template: input.template,
        batch_size: input.batch_size,
        interval_secs: input.interval_secs,
        max_retries: input.max_retries,
        dedupe: input.dedupe,
        track_delivery: input.track_delivery,
        scheduled_at: input.scheduled_at,
    };

    let campaign = state
        .engine
        .create_campaign(new, recipients)
        .await
        .map_err(api_error)?;

    info!("Created campaign {}", campaign.id);

    Ok((
        StatusCode::CREATED,
        Json(CreateCampaignResponse {
            campaign,
            recipient_ids,
        }),
    ))
}

/// Get a campaign by ID
///
/// GET /api/v1/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state
        .engine
        .get_campaign(campaign_id)
        .await
        .map_err(api_error)?;
    Ok(Json(campaign))
}

/// Validate and start a campaign
///
/// POST /api/v1/campaigns/:campaign_id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignStateResponse>, ApiError> {
    let new_state = state.engine.start(campaign_id).await.map_err(api_error)?;
    Ok(Json(CampaignStateResponse {
        id: campaign_id,
        state: new_state,
    }))
}

/// Pause a running campaign
///
/// POST /api/v1/campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignStateResponse>, ApiError> {
    let new_state = state.engine.pause(campaign_id).await.map_err(api_error)?;
    Ok(Json(CampaignStateResponse {
        id: campaign_id,
        state: new_state,
    }))
}

/// Resume a paused campaign
///
/// POST /api/v1/campaigns/:campaign_id/resume
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignStateResponse>, ApiError> {
    let new_state = state.engine.resume(campaign_id).await.map_err(api_error)?;
    Ok(Json(CampaignStateResponse {
        id: campaign_id,
        state: new_state,
    }))
}

/// Cancel a campaign
///
/// POST /api/v1/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignStateResponse>, ApiError> {
    let new_state = state.engine.cancel(campaign_id).await.map_err(api_error)?;
    Ok(Json(CampaignStateResponse {
        id: campaign_id,
        state: new_state,
    }))
}

/// Get campaign statistics
///
/// GET /api/v1/campaigns/:campaign_id/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignStats>, ApiError> {
    let stats = state.engine.stats(campaign_id).await.map_err(api_error)?;
    Ok(Json(stats))
}

/// Attempt history of one recipient
///
/// GET /api/v1/campaigns/:campaign_id/recipients/:recipient_id/attempts
pub async fn list_recipient_attempts(
    State(state): State<Arc<AppState>>,
    Path((campaign_id, recipient_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AttemptListResponse>, ApiError> {
    let data = state
        .engine
        .attempt_history(campaign_id, recipient_id)
        .await
        .map_err(api_error)?;
    Ok(Json(AttemptListResponse { data }))
}
