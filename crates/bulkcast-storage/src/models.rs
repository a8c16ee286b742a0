//! Campaign, recipient and delivery attempt models

use bulkcast_common::types::{AttemptNumber, CampaignId, RecipientId};
use bulkcast_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Campaign type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    /// Same literal message for every recipient
    Broadcast,
    /// Template rendered per recipient from its variables
    Personalized,
    /// Broadcast held back until `scheduled_at`
    Scheduled,
}

impl std::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignType::Broadcast => write!(f, "broadcast"),
            CampaignType::Personalized => write!(f, "personalized"),
            CampaignType::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl std::str::FromStr for CampaignType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(CampaignType::Broadcast),
            "personalized" => Ok(CampaignType::Personalized),
            "scheduled" => Ok(CampaignType::Scheduled),
            _ => Err(format!("Invalid campaign type: {}", s)),
        }
    }
}

/// Campaign lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Validated,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignState::Completed | CampaignState::Cancelled | CampaignState::Failed
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: CampaignState) -> bool {
        use CampaignState::*;

        matches!(
            (self, next),
            (Draft, Validated)
                | (Draft, Failed)
                | (Validated, Running)
                | (Validated, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignState::Draft => write!(f, "draft"),
            CampaignState::Validated => write!(f, "validated"),
            CampaignState::Running => write!(f, "running"),
            CampaignState::Paused => write!(f, "paused"),
            CampaignState::Completed => write!(f, "completed"),
            CampaignState::Cancelled => write!(f, "cancelled"),
            CampaignState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignState::Draft),
            "validated" => Ok(CampaignState::Validated),
            "running" => Ok(CampaignState::Running),
            "paused" => Ok(CampaignState::Paused),
            "completed" => Ok(CampaignState::Completed),
            "cancelled" => Ok(CampaignState::Cancelled),
            "failed" => Ok(CampaignState::Failed),
            _ => Err(format!("Invalid campaign state: {}", s)),
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub campaign_type: CampaignType,
    pub template: String,
    pub batch_size: i32,
    pub interval_secs: i64,
    pub max_retries: i32,
    pub dedupe: bool,
    pub track_delivery: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub state: CampaignState,
    pub total_recipients: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Total attempts allowed per recipient (`max_retries + 1`)
    pub fn max_attempts(&self) -> AttemptNumber {
        self.max_retries.max(0) as AttemptNumber + 1
    }

    /// Pause between two batches
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(0) as u64)
    }

    /// Batch size as a usize, never zero
    pub fn batch_len(&self) -> usize {
        self.batch_size.max(1) as usize
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
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
}

fn default_true() -> bool {
    true
}

impl NewCampaign {
    /// Build a draft campaign with a fresh identifier
    pub fn into_draft(self) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: uuid::Uuid::new_v4(),
            name: self.name,
            campaign_type: self.campaign_type,
            template: self.template,
            batch_size: self.batch_size,
            interval_secs: self.interval_secs,
            max_retries: self.max_retries,
            dedupe: self.dedupe,
            track_delivery: self.track_delivery,
            scheduled_at: self.scheduled_at,
            state: CampaignState::Draft,
            total_recipients: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Recipient model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub address: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Recipient {
    /// Create a recipient without variables
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            address: address.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Add a template variable
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Delivery attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl AttemptStatus {
    /// Whether the attempt has finished
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Delivered | AttemptStatus::Failed)
    }

    /// Monotone progression: pending -> sent -> delivered | failed
    pub fn can_advance_to(self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;

        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Sent, Delivered) | (Sent, Failed)
        )
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Pending => write!(f, "pending"),
            AttemptStatus::Sent => write!(f, "sent"),
            AttemptStatus::Delivered => write!(f, "delivered"),
            AttemptStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "sent" => Ok(AttemptStatus::Sent),
            "delivered" => Ok(AttemptStatus::Delivered),
            "failed" => Ok(AttemptStatus::Failed),
            _ => Err(format!("Invalid attempt status: {}", s)),
        }
    }
}

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response within the send timeout
    Timeout,
    /// Network or provider-side error
    Transport,
    /// Process stopped while the attempt was in flight
    Interrupted,
    /// Address cannot be sent to
    MalformedAddress,
    /// Provider refused the message
    Rejected,
}

impl FailureKind {
    /// Transient failures are eligible for retry
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Transport | FailureKind::Interrupted
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Interrupted => write!(f, "interrupted"),
            FailureKind::MalformedAddress => write!(f, "malformed_address"),
            FailureKind::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "transport" => Ok(FailureKind::Transport),
            "interrupted" => Ok(FailureKind::Interrupted),
            "malformed_address" => Ok(FailureKind::MalformedAddress),
            "rejected" => Ok(FailureKind::Rejected),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

/// One try at sending to one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub attempt_number: AttemptNumber,
    pub status: AttemptStatus,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Create a pending attempt
    pub fn new(
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        attempt_number: AttemptNumber,
    ) -> Self {
        Self {
            campaign_id,
            recipient_id,
            attempt_number,
            status: AttemptStatus::Pending,
            failure: None,
            error: None,
            provider_message_id: None,
            updated_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: AttemptStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(Error::InvalidState(format!(
                "attempt {} of recipient {} cannot move from {} to {}",
                self.attempt_number, self.recipient_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Handed to the channel adapter
    pub fn mark_sent(&mut self) -> Result<()> {
        self.advance(AttemptStatus::Sent)
    }

    /// Confirmed by the channel adapter
    pub fn mark_delivered(&mut self, provider_message_id: Option<String>) -> Result<()> {
        self.advance(AttemptStatus::Delivered)?;
        self.provider_message_id = provider_message_id;
        Ok(())
    }

    /// Failed with a classified reason
    pub fn mark_failed(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<()> {
        self.advance(AttemptStatus::Failed)?;
        self.failure = Some(kind);
        self.error = Some(reason.into());
        Ok(())
    }

    /// Failed and no further attempt may follow under `max_attempts`
    pub fn is_final_failure(&self, max_attempts: AttemptNumber) -> bool {
        self.status == AttemptStatus::Failed
            && (self.attempt_number >= max_attempts
                || !self.failure.map(FailureKind::is_transient).unwrap_or(false))
    }
}

/// Campaign statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub state: CampaignState,
    /// Recipients admitted into the run (after dedup)
    pub total_recipients: u64,
    /// Recipients queued or waiting for a retry
    pub pending: u64,
    /// Recipients with an attempt in flight
    pub sent: u64,
    pub delivered: u64,
    /// Recipients failed with no attempts left
    pub failed: u64,
    pub attempts_issued: u64,
    pub attempts_in_flight: u64,
    pub attempts_delivered: u64,
    pub attempts_failed: u64,
    pub progress_percentage: f64,
}

impl CampaignStats {
    /// Recompute statistics from persisted attempts
    pub fn from_attempts<I>(campaign: &Campaign, admitted: I, attempts: &[DeliveryAttempt]) -> Self
    where
        I: IntoIterator<Item = RecipientId>,
    {
        let max_attempts = campaign.max_attempts();
        let mut latest: HashMap<RecipientId, &DeliveryAttempt> = HashMap::new();
        let mut stats = Self::empty(campaign.id, campaign.state);

        for attempt in attempts.iter().filter(|a| a.campaign_id == campaign.id) {
            stats.attempts_issued += 1;
            match attempt.status {
                AttemptStatus::Pending | AttemptStatus::Sent => stats.attempts_in_flight += 1,
                AttemptStatus::Delivered => stats.attempts_delivered += 1,
                AttemptStatus::Failed => stats.attempts_failed += 1,
            }

            let newer = latest
                .get(&attempt.recipient_id)
                .map_or(true, |current| attempt.attempt_number > current.attempt_number);
            if newer {
                latest.insert(attempt.recipient_id, attempt);
            }
        }

        for recipient_id in admitted {
            stats.total_recipients += 1;
            match latest.get(&recipient_id) {
                None => stats.pending += 1,
                Some(a) => match a.status {
                    AttemptStatus::Pending | AttemptStatus::Sent => stats.sent += 1,
                    AttemptStatus::Delivered => stats.delivered += 1,
                    AttemptStatus::Failed if a.is_final_failure(max_attempts) => stats.failed += 1,
                    AttemptStatus::Failed => stats.pending += 1,
                },
            }
        }

        stats.refresh_progress();
        stats
    }

    /// Statistics with every counter at zero
    pub fn empty(campaign_id: CampaignId, state: CampaignState) -> Self {
        Self {
            campaign_id,
            state,
            total_recipients: 0,
            pending: 0,
            sent: 0,
            delivered: 0,
            failed: 0,
            attempts_issued: 0,
            attempts_in_flight: 0,
            attempts_delivered: 0,
            attempts_failed: 0,
            progress_percentage: 0.0,
        }
    }

    /// Recalculate the progress percentage from the counters
    pub fn refresh_progress(&mut self) {
        self.progress_percentage = if self.total_recipients == 0 {
            0.0
        } else {
            ((self.delivered + self.failed) as f64 / self.total_recipients as f64) * 100.0
        };
    }

    /// Both conservation laws hold
    pub fn is_consistent(&self) -> bool {
        self.pending + self.sent + self.delivered + self.failed == self.total_recipients
            && self.attempts_in_flight + self.attempts_delivered + self.attempts_failed
                == self.attempts_issued
    }
}
