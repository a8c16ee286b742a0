//! Bulkcast Core - Campaign dispatch engine
//!
//! This crate validates campaigns, renders their messages, paces batches
//! through a bounded worker pool, retries transient failures and keeps
//! live delivery statistics for every campaign.

pub mod channel;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod template;
pub mod tracker;
pub mod validator;
pub mod worker;

pub use channel::{ChannelAdapter, HttpChannelAdapter, LogChannelAdapter, SendOutcome};
pub use engine::CampaignEngine;
pub use error::CampaignError;
pub use metrics::EngineMetrics;
pub use rate_limiter::RateLimitedChannel;
pub use retry::RetryPolicy;
pub use tracker::StatusTracker;
pub use validator::{CampaignValidator, ValidatedCampaign};
