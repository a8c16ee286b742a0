//! Recipient Queue Builder - Deduplicated, rendered send queue

use crate::dedup::dedup_recipients;
use crate::error::CampaignError;
use crate::template::TemplateRenderer;
use crate::validator::ValidatedCampaign;
use bulkcast_common::types::AttemptNumber;
use bulkcast_storage::models::{Campaign, CampaignType, Recipient};
use std::collections::VecDeque;

/// One send waiting in a campaign's queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSend {
    pub recipient: Recipient,
    pub message: String,
    pub attempt: AttemptNumber,
}

impl QueuedSend {
    /// The same recipient and message for the following attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            recipient: self.recipient.clone(),
            message: self.message.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// Render the message of one recipient
pub fn render_message(
    campaign: &Campaign,
    renderer: &TemplateRenderer,
    recipient: &Recipient,
) -> Result<String, CampaignError> {
    match campaign.campaign_type {
        CampaignType::Personalized => {
            renderer
                .render(&recipient.variables)
                .map_err(|variable| CampaignError::Template {
                    recipient_id: recipient.id,
                    variable,
                })
        }
        CampaignType::Broadcast | CampaignType::Scheduled => Ok(renderer.render_literal()),
    }
}

/// Build the ordered send queue of a validated campaign
pub fn build_queue(
    campaign: &ValidatedCampaign,
    recipients: Vec<Recipient>,
) -> Result<VecDeque<QueuedSend>, CampaignError> {
    let renderer = TemplateRenderer::new(campaign.template.as_str());

    dedup_recipients(recipients, campaign.dedupe)
        .into_iter()
        .map(|recipient| {
            let message = render_message(campaign, &renderer, &recipient)?;
            Ok::<_, CampaignError>(QueuedSend {
                recipient,
                message,
                attempt: 1,
            })
        })
        .collect()
}

/// Take the next batch of at most `batch_size` sends from the front of the queue
pub fn next_batch(queue: &mut VecDeque<QueuedSend>, batch_size: usize) -> Vec<QueuedSend> {
    let len = batch_size.max(1).min(queue.len());
    queue.drain(..len).collect()
}
