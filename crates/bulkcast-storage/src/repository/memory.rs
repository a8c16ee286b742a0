//! In-memory campaign repository

use async_trait::async_trait;
use bulkcast_common::types::CampaignId;
use bulkcast_common::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::CampaignRepository;
use crate::models::{Campaign, CampaignState, DeliveryAttempt, Recipient};

struct CampaignRecord {
    campaign: Campaign,
    recipients: Vec<Recipient>,
    attempts: Vec<DeliveryAttempt>,
}

/// Campaign repository kept in process memory
#[derive(Default)]
pub struct MemoryCampaignRepository {
    records: RwLock<HashMap<CampaignId, CampaignRecord>>,
}

impl MemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: CampaignId) -> Error {
    Error::NotFound(format!("campaign {}", id))
}

#[async_trait]
impl CampaignRepository for MemoryCampaignRepository {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&campaign.id) {
            return Err(Error::Database(format!("campaign {} already exists", campaign.id)));
        }

        records.insert(
            campaign.id,
            CampaignRecord {
                campaign: campaign.clone(),
                recipients: Vec::new(),
                attempts: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let records = self.records.read().await;
        Ok(records.get(&id).map(|r| r.campaign.clone()))
    }

    async fn list_campaigns_by_state(&self, states: &[CampaignState]) -> Result<Vec<Campaign>> {
        let records = self.records.read().await;
        let mut campaigns: Vec<Campaign> = records
            .values()
            .filter(|r| states.contains(&r.campaign.state))
            .map(|r| r.campaign.clone())
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn update_campaign_state(&self, id: CampaignId, state: CampaignState) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;

        let now = Utc::now();
        let campaign = &mut record.campaign;
        campaign.state = state;
        campaign.updated_at = now;
        if state == CampaignState::Running && campaign.started_at.is_none() {
            campaign.started_at = Some(now);
        }
        if state.is_terminal() {
            campaign.completed_at = Some(now);
        }
        Ok(())
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        record.campaign.total_recipients = total;
        record.campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn save_recipients(&self, id: CampaignId, recipients: &[Recipient]) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        record.recipients = recipients.to_vec();
        Ok(())
    }

    async fn load_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| r.recipients.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&attempt.campaign_id)
            .ok_or_else(|| not_found(attempt.campaign_id))?;

        match record.attempts.iter_mut().find(|a| {
            a.recipient_id == attempt.recipient_id && a.attempt_number == attempt.attempt_number
        }) {
            Some(existing) => *existing = attempt.clone(),
            None => record.attempts.push(attempt.clone()),
        }
        Ok(())
    }

    async fn list_attempts(&self, id: CampaignId) -> Result<Vec<DeliveryAttempt>> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| r.attempts.clone())
            .ok_or_else(|| not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, CampaignType, FailureKind, NewCampaign};
    use pretty_assertions::assert_eq;

    fn draft() -> Campaign {
        NewCampaign {
            name: "Welcome".to_string(),
            campaign_type: CampaignType::Personalized,
            template: "Hi {{name}}".to_string(),
            batch_size: 50,
            interval_secs: 1,
            max_retries: 2,
            dedupe: true,
            track_delivery: true,
            scheduled_at: None,
        }
        .into_draft()
    }

    #[tokio::test]
    async fn test_campaign_lifecycle_persistence() {
        let repo = MemoryCampaignRepository::new();
        let campaign = draft();
        repo.create_campaign(&campaign).await.unwrap();
        assert!(repo.create_campaign(&campaign).await.is_err());

        repo.update_campaign_state(campaign.id, CampaignState::Running)
            .await
            .unwrap();
        let stored = repo.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CampaignState::Running);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_none());

        repo.update_campaign_state(campaign.id, CampaignState::Completed)
            .await
            .unwrap();
        let running = repo
            .list_campaigns_by_state(&[CampaignState::Running])
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_recipients_keep_order() {
        let repo = MemoryCampaignRepository::new();
        let campaign = draft();
        repo.create_campaign(&campaign).await.unwrap();

        let recipients = vec![
            Recipient::new("+15550000003"),
            Recipient::new("+15550000001"),
            Recipient::new("+15550000002"),
        ];
        repo.save_recipients(campaign.id, &recipients).await.unwrap();

        assert_eq!(repo.load_recipients(campaign.id).await.unwrap(), recipients);
    }

    #[tokio::test]
    async fn test_record_attempt_upserts() {
        let repo = MemoryCampaignRepository::new();
        let campaign = draft();
        repo.create_campaign(&campaign).await.unwrap();

        let recipient = Recipient::new("+15550000001");
        let mut attempt = DeliveryAttempt::new(campaign.id, recipient.id, 1);
        attempt.mark_sent().unwrap();
        repo.record_attempt(&attempt).await.unwrap();

        attempt.mark_failed(FailureKind::Timeout, "timeout").unwrap();
        repo.record_attempt(&attempt).await.unwrap();

        let attempts = repo.list_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_unknown_campaign() {
        let repo = MemoryCampaignRepository::new();
        let id = uuid::Uuid::new_v4();
        assert!(repo.get_campaign(id).await.unwrap().is_none());
        assert!(matches!(
            repo.update_campaign_state(id, CampaignState::Running).await,
            Err(Error::NotFound(_))
        ));
    }
}
