//! Delivery Worker Pool - Sends one batch with bounded concurrency

use crate::channel::{ChannelAdapter, SendOutcome};
use crate::metrics::EngineMetrics;
use crate::queue::QueuedSend;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tracker::CampaignTracker;
use bulkcast_common::types::CampaignId;
use bulkcast_storage::models::{DeliveryAttempt, FailureKind};
use bulkcast_storage::repository::CampaignRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What happened to one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Sends to schedule again after their backoff
    pub retries: Vec<(QueuedSend, Duration)>,
    /// Sends not issued in this batch; they go back to the front of the queue
    pub skipped: Vec<QueuedSend>,
    /// An attempt could not be persisted. No further batch may be emitted
    /// until storage recovers.
    pub storage_failed: bool,
}

enum SendResult {
    Finished {
        send: QueuedSend,
        attempt: DeliveryAttempt,
        decision: RetryDecision,
        persisted: bool,
    },
    /// The attempt could not be persisted, so the message was never sent
    Unsent(QueuedSend),
}

/// Worker pool shared by every campaign of an engine
pub struct WorkerPool {
    channel: Arc<dyn ChannelAdapter>,
    repository: Arc<dyn CampaignRepository>,
    metrics: Arc<EngineMetrics>,
    /// Maximum concurrent sends per batch
    concurrency_limit: usize,
    send_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        repository: Arc<dyn CampaignRepository>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            channel,
            repository,
            metrics,
            concurrency_limit: 10,
            send_timeout: Duration::from_secs(10),
        }
    }

    /// Set concurrency limit
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set per-send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Send every recipient of `batch` and return once each issued attempt
    /// has reached a terminal status and been recorded. A failed attempt
    /// write stops the rest of the batch from being issued.
    pub async fn dispatch(
        &self,
        campaign_id: CampaignId,
        tracker: &Arc<CampaignTracker>,
        policy: &RetryPolicy,
        batch: Vec<QueuedSend>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let halt = cancel.child_token();
        let task = SendTask {
            channel: Arc::clone(&self.channel),
            repository: Arc::clone(&self.repository),
            metrics: Arc::clone(&self.metrics),
            tracker: Arc::clone(tracker),
            policy: policy.clone(),
            send_timeout: self.send_timeout,
            halt: halt.clone(),
        };

        let mut report = BatchReport::default();
        let mut handles = Vec::with_capacity(batch.len());
        let mut pending = batch.into_iter();

        while let Some(send) = pending.next() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool semaphore closed: {}", e);
                    report.skipped.push(send);
                    report.skipped.extend(pending.by_ref());
                    break;
                }
            };

            if halt.is_cancelled() {
                debug!(%campaign_id, "Not issuing remaining sends of batch");
                report.skipped.push(send);
                report.skipped.extend(pending.by_ref());
                break;
            }

            let mut attempt = DeliveryAttempt::new(campaign_id, send.recipient.id, send.attempt);
            if let Err(e) = attempt
                .mark_sent()
                .and_then(|()| tracker.begin_attempt(&attempt))
            {
                warn!(
                    %campaign_id,
                    recipient_id = %send.recipient.id,
                    attempt = send.attempt,
                    "Deferring send: {}", e
                );
                report.skipped.push(send);
                continue;
            }

            let handle = tokio::spawn(task.clone().run(send.clone(), attempt.clone(), permit));
            handles.push((send, attempt, handle));
        }

        // Wait for all tasks to complete
        for (send, attempt, handle) in handles {
            let result = match handle.await {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(
                        %campaign_id,
                        recipient_id = %attempt.recipient_id,
                        attempt = attempt.attempt_number,
                        "Send task failed: {}", e
                    );
                    task.recover(send, attempt).await
                }
            };

            match result {
                Some(SendResult::Finished {
                    send,
                    attempt,
                    decision,
                    persisted,
                }) => {
                    report.storage_failed |= !persisted;
                    match decision {
                        RetryDecision::Done => report.delivered += 1,
                        RetryDecision::Retry { delay, .. } => {
                            report.failed += 1;
                            report.retries.push((send.next_attempt(), delay));
                        }
                        RetryDecision::GiveUp => {
                            report.failed += 1;
                            debug!(
                                recipient_id = %attempt.recipient_id,
                                attempt = attempt.attempt_number,
                                "Recipient failed terminally"
                            );
                        }
                    }
                }
                Some(SendResult::Unsent(send)) => {
                    report.storage_failed = true;
                    report.skipped.push(send);
                }
                None => {}
            }
        }

        report
    }

    /// Apply the channel outcome to the attempt and consult the retry policy
    fn finish(attempt: &mut DeliveryAttempt, outcome: SendOutcome, policy: &RetryPolicy) -> RetryDecision {
        let applied = match outcome {
            SendOutcome::Delivered {
                provider_message_id,
            } => attempt.mark_delivered(provider_message_id),
            SendOutcome::Failed { kind, reason } => {
                warn!(
                    recipient_id = %attempt.recipient_id,
                    attempt = attempt.attempt_number,
                    failure = %kind,
                    "Send failed: {}", reason
                );
                attempt.mark_failed(kind, reason)
            }
        };
        if let Err(e) = applied {
            error!("Failed to finish attempt: {}", e);
        }
        policy.decide(attempt)
    }
}

/// One send of a batch, run on its own task
#[derive(Clone)]
struct SendTask {
    channel: Arc<dyn ChannelAdapter>,
    repository: Arc<dyn CampaignRepository>,
    metrics: Arc<EngineMetrics>,
    tracker: Arc<CampaignTracker>,
    policy: RetryPolicy,
    send_timeout: Duration,
    /// Cancelled when an attempt write fails
    halt: CancellationToken,
}

impl SendTask {
    async fn run(
        self,
        send: QueuedSend,
        mut attempt: DeliveryAttempt,
        _permit: OwnedSemaphorePermit,
    ) -> SendResult {
        // Rate limit waits are not part of the send timeout
        self.channel.acquire().await;

        if let Err(e) = self.repository.record_attempt(&attempt).await {
            error!(
                recipient_id = %attempt.recipient_id,
                attempt = attempt.attempt_number,
                "Failed to persist attempt, not sending: {}", e
            );
            self.halt.cancel();
            if let Err(e) = self.tracker.abandon_attempt(&attempt) {
                error!(recipient_id = %attempt.recipient_id, "Failed to withdraw attempt: {}", e);
            }
            return SendResult::Unsent(send);
        }

        let outcome = match tokio::time::timeout(
            self.send_timeout,
            self.channel.send(&send.recipient, &send.message),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::failed(
                FailureKind::Timeout,
                format!("no response within {}s", self.send_timeout.as_secs_f64()),
            ),
        };

        let decision = WorkerPool::finish(&mut attempt, outcome, &self.policy);
        if let Err(e) = self.tracker.finish_attempt(&attempt, decision.will_retry()) {
            error!(recipient_id = %attempt.recipient_id, "Failed to track attempt: {}", e);
        }
        self.complete(send, attempt, decision).await
    }

    /// Settle an attempt whose task died before reporting, as an
    /// interrupted failure
    async fn recover(&self, send: QueuedSend, mut attempt: DeliveryAttempt) -> Option<SendResult> {
        if let Err(e) = attempt.mark_failed(FailureKind::Interrupted, "send task aborted") {
            error!(recipient_id = %attempt.recipient_id, "Failed to finish attempt: {}", e);
            return None;
        }
        let decision = self.policy.decide(&attempt);
        if let Err(e) = self.tracker.finish_attempt(&attempt, decision.will_retry()) {
            // Already settled before the task died
            warn!(recipient_id = %attempt.recipient_id, "Not recovering attempt: {}", e);
            return None;
        }
        Some(self.complete(send, attempt, decision).await)
    }

    /// Persist the terminal status of a tracked attempt
    async fn complete(
        &self,
        send: QueuedSend,
        attempt: DeliveryAttempt,
        decision: RetryDecision,
    ) -> SendResult {
        let persisted = match self.repository.record_attempt(&attempt).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    recipient_id = %attempt.recipient_id,
                    attempt = attempt.attempt_number,
                    "Failed to persist attempt: {}", e
                );
                self.halt.cancel();
                false
            }
        };

        let label = match attempt.failure {
            Some(kind) => kind.to_string(),
            None => "delivered".to_string(),
        };
        self.metrics.record_attempt(&label);

        SendResult::Finished {
            send,
            attempt,
            decision,
            persisted,
        }
    }
}

/// Repository doubles for storage failure tests
#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use bulkcast_common::types::CampaignId;
    use bulkcast_common::{Error, Result};
    use bulkcast_storage::models::{Campaign, CampaignState, DeliveryAttempt, Recipient};
    use bulkcast_storage::repository::{CampaignRepository, MemoryCampaignRepository};
    use std::time::Duration;

    /// Attempt writes that fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailingWrites {
        /// Every attempt write
        All,
        /// Only writes of a terminal status
        Outcomes,
    }

    /// In-memory repository that cannot record some attempts, or that is
    /// slow to store state changes
    pub struct UnreliableRepository {
        inner: MemoryCampaignRepository,
        failing: Option<FailingWrites>,
        state_write_delay: Duration,
    }

    impl UnreliableRepository {
        pub fn new(failing: FailingWrites) -> Self {
            Self {
                inner: MemoryCampaignRepository::new(),
                failing: Some(failing),
                state_write_delay: Duration::ZERO,
            }
        }

        /// Every state change takes `delay` to store
        pub fn slow_state_writes(delay: Duration) -> Self {
            Self {
                inner: MemoryCampaignRepository::new(),
                failing: None,
                state_write_delay: delay,
            }
        }
    }

    #[async_trait]
    impl CampaignRepository for UnreliableRepository {
        async fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
            self.inner.create_campaign(campaign).await
        }

        async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
            self.inner.get_campaign(id).await
        }

        async fn list_campaigns_by_state(&self, states: &[CampaignState]) -> Result<Vec<Campaign>> {
            self.inner.list_campaigns_by_state(states).await
        }

        async fn update_campaign_state(&self, id: CampaignId, state: CampaignState) -> Result<()> {
            if !self.state_write_delay.is_zero() {
                tokio::time::sleep(self.state_write_delay).await;
            }
            self.inner.update_campaign_state(id, state).await
        }

        async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
            self.inner.set_total_recipients(id, total).await
        }

        async fn save_recipients(&self, id: CampaignId, recipients: &[Recipient]) -> Result<()> {
            self.inner.save_recipients(id, recipients).await
        }

        async fn load_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>> {
            self.inner.load_recipients(id).await
        }

        async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
            let fails = match self.failing {
                Some(FailingWrites::All) => true,
                Some(FailingWrites::Outcomes) => attempt.status.is_terminal(),
                None => false,
            };
            if fails {
                return Err(Error::Database("connection refused".to_string()));
            }
            self.inner.record_attempt(attempt).await
        }

        async fn list_attempts(&self, id: CampaignId) -> Result<Vec<DeliveryAttempt>> {
            self.inner.list_attempts(id).await
        }
    }
}
