//! Retry Manager - Decides whether a failed attempt is re-queued
//!
//! A failed attempt is retried when its failure is transient and the
//! recipient still has attempts left (`max_retries + 1` in total). The
//! backoff before attempt `n + 1` is `base * 2^(n - 1)`, capped at the
//! configured maximum. Waiting retries live in a [`RetryQueue`] timer
//! wheel and never hold a worker slot.

use crate::queue::QueuedSend;
use bulkcast_common::config::DispatchConfig;
use bulkcast_common::types::AttemptNumber;
use bulkcast_storage::models::{AttemptStatus, Campaign, DeliveryAttempt};
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio_util::time::DelayQueue;

/// Outcome of consulting the retry policy for one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt succeeded, nothing to retry
    Done,
    /// Schedule `next_attempt` after `delay`
    Retry {
        next_attempt: AttemptNumber,
        delay: Duration,
    },
    /// Failed with no attempts left, or failed permanently
    GiveUp,
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Retry policy of one campaign
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed per recipient
    pub max_attempts: AttemptNumber,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with the default backoff
    pub fn new(max_attempts: AttemptNumber) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: defaults::BASE_DELAY,
            max_delay: defaults::MAX_DELAY,
        }
    }

    /// Policy of `campaign` with the backoff from the dispatch configuration
    pub fn for_campaign(campaign: &Campaign, config: &DispatchConfig) -> Self {
        Self::new(campaign.max_attempts()).with_backoff(
            Duration::from_secs(config.retry_base_delay_secs),
            Duration::from_secs(config.retry_max_delay_secs),
        )
    }

    /// Set base and maximum backoff delay
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Delay before the attempt following `attempt_number`
    pub fn backoff(&self, attempt_number: AttemptNumber) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether no attempt may follow `attempt_number`
    pub fn is_final_attempt(&self, attempt_number: AttemptNumber) -> bool {
        attempt_number >= self.max_attempts
    }

    /// Decide what follows a finished attempt
    pub fn decide(&self, attempt: &DeliveryAttempt) -> RetryDecision {
        match attempt.status {
            AttemptStatus::Delivered => RetryDecision::Done,
            AttemptStatus::Failed => {
                let transient = attempt.failure.map(|f| f.is_transient()).unwrap_or(false);
                if transient && !self.is_final_attempt(attempt.attempt_number) {
                    RetryDecision::Retry {
                        next_attempt: attempt.attempt_number + 1,
                        delay: self.backoff(attempt.attempt_number),
                    }
                } else {
                    RetryDecision::GiveUp
                }
            }
            // Unfinished attempts are never retried
            AttemptStatus::Pending | AttemptStatus::Sent => RetryDecision::GiveUp,
        }
    }
}

pub mod defaults {
    use std::time::Duration;

    pub const BASE_DELAY: Duration = Duration::from_secs(2);
    pub const MAX_DELAY: Duration = Duration::from_secs(60);
}

/// Sends waiting for their backoff to elapse
#[derive(Default)]
pub struct RetryQueue {
    delayed: DelayQueue<QueuedSend>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `send` to become ready after `delay`
    pub fn schedule(&mut self, send: QueuedSend, delay: Duration) {
        self.delayed.insert(send, delay);
    }

    pub fn len(&self) -> usize {
        self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }

    /// Drop every waiting retry
    pub fn clear(&mut self) {
        self.delayed.clear();
    }

    /// Every send whose backoff has already elapsed, without waiting
    pub async fn drain_ready(&mut self) -> Vec<QueuedSend> {
        let mut ready = Vec::new();
        loop {
            let next = poll_fn(|cx| match self.delayed.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(Some(expired.into_inner())),
                _ => Poll::Ready(None),
            })
            .await;

            match next {
                Some(send) => ready.push(send),
                None => return ready,
            }
        }
    }

    /// Wait for the next send to become ready; `None` when nothing waits
    pub async fn next_ready(&mut self) -> Option<QueuedSend> {
        poll_fn(|cx| self.delayed.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }
}
