//! Campaign Validator - Structural and template checks before dispatch

use crate::error::CampaignError;
use crate::template::TemplateRenderer;
use bulkcast_storage::models::{Campaign, CampaignState, CampaignType, Recipient};
use std::collections::HashSet;
use std::ops::Deref;

/// A campaign that passed validation. Only [`CampaignValidator`] builds one.
#[derive(Debug, Clone)]
pub struct ValidatedCampaign {
    campaign: Campaign,
}

impl ValidatedCampaign {
    pub fn into_inner(self) -> Campaign {
        self.campaign
    }
}

impl Deref for ValidatedCampaign {
    type Target = Campaign;

    fn deref(&self) -> &Campaign {
        &self.campaign
    }
}

/// Campaign validator
pub struct CampaignValidator;

impl CampaignValidator {
    /// Validate a campaign definition against its recipient list
    pub fn validate(
        campaign: &Campaign,
        recipients: &[Recipient],
    ) -> Result<ValidatedCampaign, CampaignError> {
        if campaign.name.trim().is_empty() {
            return Err(CampaignError::validation("name", "must not be empty"));
        }
        if campaign.template.trim().is_empty() {
            return Err(CampaignError::validation("template", "must not be empty"));
        }
        if recipients.is_empty() {
            return Err(CampaignError::validation("recipients", "must not be empty"));
        }
        let mut seen = HashSet::with_capacity(recipients.len());
        if let Some(repeated) = recipients.iter().find(|r| !seen.insert(r.id)) {
            return Err(CampaignError::validation(
                "recipients",
                format!("recipient {} is listed more than once", repeated.id),
            ));
        }
        if campaign.batch_size <= 0 {
            return Err(CampaignError::validation(
                "batch_size",
                "must be greater than zero",
            ));
        }
        if campaign.interval_secs < 0 {
            return Err(CampaignError::validation("interval_secs", "must not be negative"));
        }
        if campaign.max_retries < 0 {
            return Err(CampaignError::validation("max_retries", "must not be negative"));
        }
        if campaign.campaign_type == CampaignType::Scheduled && campaign.scheduled_at.is_none() {
            return Err(CampaignError::validation(
                "scheduled_at",
                "is required for scheduled campaigns",
            ));
        }

        if campaign.campaign_type == CampaignType::Personalized {
            let renderer = TemplateRenderer::new(campaign.template.as_str());
            for recipient in recipients {
                if let Some(variable) = renderer.first_missing(&recipient.variables) {
                    return Err(CampaignError::Template {
                        recipient_id: recipient.id,
                        variable,
                    });
                }
            }
        }

        let mut campaign = campaign.clone();
        campaign.state = CampaignState::Validated;
        Ok(ValidatedCampaign { campaign })
    }
}
