//! Dispatch engine errors

use bulkcast_common::types::{CampaignId, RecipientId};
use bulkcast_storage::models::CampaignState;
use thiserror::Error;

/// Campaign engine errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Recipient {recipient_id} is missing template variable '{variable}'")]
    Template {
        recipient_id: RecipientId,
        variable: String,
    },

    #[error("Campaign {0} not found")]
    NotFound(CampaignId),

    #[error("Campaign cannot move from {from} to {to}")]
    InvalidTransition { from: CampaignState, to: CampaignState },

    #[error(transparent)]
    Storage(#[from] bulkcast_common::Error),
}

impl CampaignError {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        CampaignError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<CampaignError> for bulkcast_common::Error {
    fn from(err: CampaignError) -> Self {
        use bulkcast_common::Error;

        match err {
            CampaignError::Validation { .. } | CampaignError::Template { .. } => {
                Error::Validation(err.to_string())
            }
            CampaignError::NotFound(_) => Error::NotFound(err.to_string()),
            CampaignError::InvalidTransition { .. } => Error::InvalidState(err.to_string()),
            CampaignError::Storage(inner) => inner,
        }
    }
}
