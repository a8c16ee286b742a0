//! Repository layer for data access

pub mod campaigns;
pub mod memory;

use async_trait::async_trait;
use bulkcast_common::types::CampaignId;
use bulkcast_common::Result;

use crate::models::{Campaign, CampaignState, DeliveryAttempt, Recipient};

pub use campaigns::PgCampaignRepository;
pub use memory::MemoryCampaignRepository;

/// Campaign repository trait
///
/// Persists campaigns, their recipient lists and every delivery attempt so
/// that an interrupted run can be resumed without losing history.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Store a new campaign
    async fn create_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Get a campaign by ID
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// List campaigns in any of the given states
    async fn list_campaigns_by_state(&self, states: &[CampaignState]) -> Result<Vec<Campaign>>;

    /// Update the lifecycle state, stamping start and completion times
    async fn update_campaign_state(&self, id: CampaignId, state: CampaignState) -> Result<()>;

    /// Record the number of recipients admitted into the run
    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()>;

    /// Replace the ordered recipient list of a campaign
    async fn save_recipients(&self, id: CampaignId, recipients: &[Recipient]) -> Result<()>;

    /// Load the ordered recipient list of a campaign
    async fn load_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>>;

    /// Insert or update an attempt keyed by (campaign, recipient, attempt number)
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// All attempts of a campaign
    async fn list_attempts(&self, id: CampaignId) -> Result<Vec<DeliveryAttempt>>;
}
