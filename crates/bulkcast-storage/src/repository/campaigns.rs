//! PostgreSQL campaign repository

use async_trait::async_trait;
use bulkcast_common::types::CampaignId;
use bulkcast_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::CampaignRepository;
use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignState, DeliveryAttempt, Recipient};

#[derive(Debug, FromRow)]
struct CampaignRow {
    id: Uuid,
    name: String,
    campaign_type: String,
    template: String,
    batch_size: i32,
    interval_secs: i64,
    max_retries: i32,
    dedupe: bool,
    track_delivery: bool,
    scheduled_at: Option<DateTime<Utc>>,
    state: String,
    total_recipients: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = Error;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(Campaign {
            id: row.id,
            name: row.name,
            campaign_type: row.campaign_type.parse().map_err(Error::Database)?,
            template: row.template,
            batch_size: row.batch_size,
            interval_secs: row.interval_secs,
            max_retries: row.max_retries,
            dedupe: row.dedupe,
            track_delivery: row.track_delivery,
            scheduled_at: row.scheduled_at,
            state: row.state.parse().map_err(Error::Database)?,
            total_recipients: row.total_recipients,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RecipientRow {
    id: Uuid,
    address: String,
    variables: serde_json::Value,
}

impl TryFrom<RecipientRow> for Recipient {
    type Error = Error;

    fn try_from(row: RecipientRow) -> Result<Self> {
        let variables: BTreeMap<String, String> = serde_json::from_value(row.variables)
            .map_err(|e| Error::Database(format!("Invalid recipient variables: {}", e)))?;
        Ok(Recipient {
            id: row.id,
            address: row.address,
            variables,
        })
    }
}

#[derive(Debug, FromRow)]
struct AttemptRow {
    campaign_id: Uuid,
    recipient_id: Uuid,
    attempt_number: i32,
    status: String,
    failure: Option<String>,
    error: Option<String>,
    provider_message_id: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = Error;

    fn try_from(row: AttemptRow) -> Result<Self> {
        Ok(DeliveryAttempt {
            campaign_id: row.campaign_id,
            recipient_id: row.recipient_id,
            attempt_number: u32::try_from(row.attempt_number)
                .map_err(|e| Error::Database(format!("Invalid attempt number: {}", e)))?,
            status: row.status.parse().map_err(Error::Database)?,
            failure: row
                .failure
                .map(|f| f.parse())
                .transpose()
                .map_err(Error::Database)?,
            error: row.error,
            provider_message_id: row.provider_message_id,
            updated_at: row.updated_at,
        })
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Database campaign repository
#[derive(Clone)]
pub struct PgCampaignRepository {
    pool: DatabasePool,
}

impl PgCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for PgCampaignRepository {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, name, campaign_type, template, batch_size, interval_secs,
                max_retries, dedupe, track_delivery, scheduled_at, state,
                total_recipients, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.name)
        .bind(campaign.campaign_type.to_string())
        .bind(&campaign.template)
        .bind(campaign.batch_size)
        .bind(campaign.interval_secs)
        .bind(campaign.max_retries)
        .bind(campaign.dedupe)
        .bind(campaign.track_delivery)
        .bind(campaign.scheduled_at)
        .bind(campaign.state.to_string())
        .bind(campaign.total_recipients)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?
            .map(Campaign::try_from)
            .transpose()
    }

    async fn list_campaigns_by_state(&self, states: &[CampaignState]) -> Result<Vec<Campaign>> {
        let states: Vec<String> = states.iter().map(ToString::to_string).collect();

        sqlx::query_as::<_, CampaignRow>(
            "SELECT * FROM campaigns WHERE state = ANY($1) ORDER BY created_at ASC",
        )
        .bind(&states)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?
        .into_iter()
        .map(Campaign::try_from)
        .collect()
    }

    async fn update_campaign_state(&self, id: CampaignId, state: CampaignState) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                state = $2,
                updated_at = NOW(),
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.to_string())
        .bind(state.is_terminal())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("campaign {}", id)));
        }
        Ok(())
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        sqlx::query("UPDATE campaigns SET total_recipients = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(total)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn save_recipients(&self, id: CampaignId, recipients: &[Recipient]) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        sqlx::query("DELETE FROM campaign_recipients WHERE campaign_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        for (position, recipient) in recipients.iter().enumerate() {
            let variables = serde_json::to_value(&recipient.variables)
                .map_err(|e| Error::Database(format!("Invalid recipient variables: {}", e)))?;

            sqlx::query(
                r#"
                INSERT INTO campaign_recipients (campaign_id, position, id, address, variables)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(position as i32)
            .bind(recipient.id)
            .bind(&recipient.address)
            .bind(&variables)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)
    }

    async fn load_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>> {
        sqlx::query_as::<_, RecipientRow>(
            r#"
            SELECT id, address, variables FROM campaign_recipients
            WHERE campaign_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?
        .into_iter()
        .map(Recipient::try_from)
        .collect()
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                campaign_id, recipient_id, attempt_number, status, failure,
                error, provider_message_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (campaign_id, recipient_id, attempt_number)
            DO UPDATE SET
                status = EXCLUDED.status,
                failure = EXCLUDED.failure,
                error = EXCLUDED.error,
                provider_message_id = EXCLUDED.provider_message_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(attempt.campaign_id)
        .bind(attempt.recipient_id)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status.to_string())
        .bind(attempt.failure.map(|f| f.to_string()))
        .bind(&attempt.error)
        .bind(&attempt.provider_message_id)
        .bind(attempt.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_attempts(&self, id: CampaignId) -> Result<Vec<DeliveryAttempt>> {
        sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM delivery_attempts
            WHERE campaign_id = $1
            ORDER BY recipient_id, attempt_number ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?
        .into_iter()
        .map(DeliveryAttempt::try_from)
        .collect()
    }
}
