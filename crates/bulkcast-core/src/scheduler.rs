//! Batch Scheduler - Paces batch emission for one running campaign

use crate::error::CampaignError;
use crate::metrics::EngineMetrics;
use crate::queue::{next_batch, QueuedSend};
use crate::retry::{RetryPolicy, RetryQueue};
use crate::tracker::CampaignTracker;
use crate::worker::WorkerPool;
use bulkcast_storage::models::{Campaign, CampaignState, CampaignType};
use bulkcast_storage::repository::CampaignRepository;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Apply a lifecycle transition to the tracker, persist it and keep the
/// running gauge in step. Returns the previous state.
pub(crate) async fn apply_transition(
    tracker: &CampaignTracker,
    repository: &dyn CampaignRepository,
    metrics: &EngineMetrics,
    next: CampaignState,
) -> Result<CampaignState, CampaignError> {
    let previous = tracker.transition(next)?;

    if previous != CampaignState::Running && next == CampaignState::Running {
        metrics.campaigns_running.inc();
    } else if previous == CampaignState::Running && next != CampaignState::Running {
        metrics.campaigns_running.dec();
    }

    info!(campaign_id = %tracker.campaign_id(), from = %previous, to = %next, "Campaign state changed");
    if let Err(e) = repository
        .update_campaign_state(tracker.campaign_id(), next)
        .await
    {
        error!(campaign_id = %tracker.campaign_id(), "Failed to persist campaign state: {}", e);
    }
    Ok(previous)
}

/// Start time still ahead of a scheduled campaign
pub(crate) fn pending_start(campaign: &Campaign) -> Option<DateTime<Utc>> {
    match campaign.campaign_type {
        CampaignType::Scheduled => campaign.scheduled_at.filter(|at| *at > Utc::now()),
        CampaignType::Broadcast | CampaignType::Personalized => None,
    }
}

/// Control signals shared between the engine and a scheduler
#[derive(Clone)]
pub struct RunControl {
    pub paused: watch::Sender<bool>,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn new(paused: bool) -> Self {
        let (tx, _rx) = watch::channel(paused);
        Self {
            paused: tx,
            cancel: CancellationToken::new(),
        }
    }
}

/// Scheduler loop of one campaign
pub struct BatchScheduler {
    campaign: Campaign,
    queue: VecDeque<QueuedSend>,
    retries: RetryQueue,
    policy: RetryPolicy,
    pool: Arc<WorkerPool>,
    tracker: Arc<CampaignTracker>,
    repository: Arc<dyn CampaignRepository>,
    metrics: Arc<EngineMetrics>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaign: Campaign,
        queue: VecDeque<QueuedSend>,
        policy: RetryPolicy,
        pool: Arc<WorkerPool>,
        tracker: Arc<CampaignTracker>,
        repository: Arc<dyn CampaignRepository>,
        metrics: Arc<EngineMetrics>,
        control: &RunControl,
    ) -> Self {
        Self {
            campaign,
            queue,
            retries: RetryQueue::new(),
            policy,
            pool,
            tracker,
            repository,
            metrics,
            paused: control.paused.subscribe(),
            cancel: control.cancel.clone(),
        }
    }

    async fn transition(&self, next: CampaignState) -> Result<CampaignState, CampaignError> {
        apply_transition(&self.tracker, self.repository.as_ref(), &self.metrics, next).await
    }

    /// Wait for the scheduled start; false when cancelled first
    async fn wait_for_start(&self) -> bool {
        let Some(at) = pending_start(&self.campaign) else {
            return true;
        };
        let Ok(wait) = (at - Utc::now()).to_std() else {
            return true;
        };

        info!(campaign_id = %self.campaign.id, scheduled_at = %at, "Waiting for scheduled start");
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Drive the campaign until it completes or is cancelled
    pub async fn run(mut self) -> CampaignState {
        let campaign_id = self.campaign.id;

        if self.tracker.state() == CampaignState::Validated {
            if !self.wait_for_start().await {
                return self.finish(CampaignState::Cancelled).await;
            }
            if let Err(e) = self.transition(CampaignState::Running).await {
                error!(%campaign_id, "Cannot start campaign: {}", e);
                return self.tracker.state();
            }
        }

        info!(
            %campaign_id,
            queued = self.queue.len(),
            batch_size = self.campaign.batch_len(),
            interval_secs = self.campaign.interval().as_secs(),
            "Scheduler started"
        );

        let mut batch_index: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.finish(CampaignState::Cancelled).await;
            }

            self.queue.extend(self.retries.drain_ready().await);

            if self.queue.is_empty() && self.retries.is_empty() {
                return self.finish(CampaignState::Completed).await;
            }

            let paused = *self.paused.borrow_and_update();
            if paused || self.tracker.state() == CampaignState::Paused {
                debug!(%campaign_id, "Scheduler paused");
                tokio::select! {
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            return self.finish(CampaignState::Cancelled).await;
                        }
                    }
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            if self.queue.is_empty() {
                // Only retries remain; wait for the next backoff to elapse
                tokio::select! {
                    ready = self.retries.next_ready() => {
                        if let Some(send) = ready {
                            self.queue.push_back(send);
                        }
                    }
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            return self.finish(CampaignState::Cancelled).await;
                        }
                    }
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            let batch = next_batch(&mut self.queue, self.campaign.batch_len());
            batch_index += 1;
            info!(%campaign_id, batch = batch_index, size = batch.len(), "Dispatching batch");
            self.metrics.batches_total.inc();

            let report = self
                .pool
                .dispatch(campaign_id, &self.tracker, &self.policy, batch, &self.cancel)
                .await;
            debug!(
                %campaign_id,
                batch = batch_index,
                delivered = report.delivered,
                failed = report.failed,
                retries = report.retries.len(),
                "Batch finished"
            );

            // Unissued sends keep their place at the front of the queue
            for send in report.skipped.into_iter().rev() {
                self.queue.push_front(send);
            }

            if !self.cancel.is_cancelled() {
                for (send, delay) in report.retries {
                    debug!(
                        %campaign_id,
                        recipient_id = %send.recipient.id,
                        attempt = send.attempt,
                        delay_secs = delay.as_secs(),
                        "Retry scheduled"
                    );
                    self.metrics.retries_scheduled_total.inc();
                    self.retries.schedule(send, delay);
                }
            }

            if report.storage_failed {
                error!(%campaign_id, batch = batch_index, "Delivery attempts could not be stored, pausing campaign");
                if let Err(e) = self.transition(CampaignState::Paused).await {
                    debug!(%campaign_id, "Not pausing: {}", e);
                }
                continue;
            }

            let more = !self.queue.is_empty() || !self.retries.is_empty();
            let interval = self.campaign.interval();
            if more && !interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }
    }

    async fn finish(&mut self, state: CampaignState) -> CampaignState {
        if state == CampaignState::Cancelled && !self.retries.is_empty() {
            debug!(campaign_id = %self.campaign.id, dropped = self.retries.len(), "Discarding pending retries");
            self.retries.clear();
        }

        match self.transition(state).await {
            Ok(_) => info!(campaign_id = %self.campaign.id, state = %state, "Scheduler finished"),
            Err(e) => error!(campaign_id = %self.campaign.id, "Failed to finish campaign: {}", e),
        }
        self.tracker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ScriptedChannel;
    use crate::channel::SendOutcome;
    use crate::worker::testing::{FailingWrites, UnreliableRepository};
    use bulkcast_storage::models::{CampaignType, FailureKind, NewCampaign, Recipient};
    use bulkcast_storage::repository::MemoryCampaignRepository;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        campaign: Campaign,
        channel: Arc<ScriptedChannel>,
        repository: Arc<MemoryCampaignRepository>,
        tracker: Arc<CampaignTracker>,
        control: RunControl,
        metrics: Arc<EngineMetrics>,
    }

    impl Harness {
        async fn new(batch_size: i32, interval_secs: i64, max_retries: i32, channel: ScriptedChannel) -> Self {
            let mut campaign = NewCampaign {
                name: "Scheduler".to_string(),
                campaign_type: CampaignType::Broadcast,
                template: "hello".to_string(),
                batch_size,
                interval_secs,
                max_retries,
                dedupe: true,
                track_delivery: true,
                scheduled_at: None,
            }
            .into_draft();
            campaign.state = CampaignState::Running;

            let repository = Arc::new(MemoryCampaignRepository::new());
            repository.create_campaign(&campaign).await.unwrap();

            Self {
                tracker: Arc::new(CampaignTracker::new(&campaign)),
                campaign,
                channel: Arc::new(channel),
                repository,
                control: RunControl::new(false),
                metrics: Arc::new(EngineMetrics::new().unwrap()),
            }
        }

        fn scheduler(&self, addresses: &[&str]) -> BatchScheduler {
            let queue: VecDeque<QueuedSend> = addresses
                .iter()
                .map(|address| QueuedSend {
                    recipient: Recipient::new(*address),
                    message: "hello".to_string(),
                    attempt: 1,
                })
                .collect();
            self.tracker.admit(queue.len() as u64);

            let pool = WorkerPool::new(
                self.channel.clone(),
                self.repository.clone(),
                self.metrics.clone(),
            );
            BatchScheduler::new(
                self.campaign.clone(),
                queue,
                RetryPolicy::new(self.campaign.max_attempts()),
                Arc::new(pool),
                self.tracker.clone(),
                self.repository.clone(),
                self.metrics.clone(),
                &self.control,
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_paced_in_queue_order() {
        let h = Harness::new(2, 1, 0, ScriptedChannel::failing(FailureKind::Transport)).await;
        let start = tokio::time::Instant::now();

        let state = h.scheduler(&["+1001", "+1002", "+1003", "+1004", "+1005"]).run().await;

        assert_eq!(state, CampaignState::Completed);
        assert_eq!(
            h.channel.batches(),
            vec![
                vec!["+1001".to_string(), "+1002".to_string()],
                vec!["+1003".to_string(), "+1004".to_string()],
                vec!["+1005".to_string()],
            ]
        );
        let offsets: Vec<u64> = h
            .channel
            .sent()
            .iter()
            .map(|s| s.at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 0, 1, 1, 2]);

        let stats = h.tracker.snapshot();
        assert_eq!((stats.failed, stats.delivered), (5, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_join_later_batches() {
        let channel = ScriptedChannel::delivering().script(
            "+1001",
            vec![SendOutcome::transient("503"), SendOutcome::transient("503")],
        );
        let h = Harness::new(10, 0, 2, channel).await;
        let start = tokio::time::Instant::now();

        let state = h.scheduler(&["+1001", "+1002"]).run().await;

        assert_eq!(state, CampaignState::Completed);
        let retried: Vec<u64> = h
            .channel
            .sent()
            .iter()
            .filter(|s| s.address == "+1001")
            .map(|s| s.at.duration_since(start).as_secs())
            .collect();
        // backoff 2s after attempt 1, 4s after attempt 2
        assert_eq!(retried, vec![0, 2, 6]);

        let stats = h.tracker.snapshot();
        assert_eq!((stats.delivered, stats.failed), (2, 0));
        assert_eq!(stats.attempts_issued, 4);
        assert_eq!(h.repository.list_attempts(h.campaign.id).await.unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap() {
        let h = Harness::new(10, 0, 2, ScriptedChannel::failing(FailureKind::Timeout)).await;

        let state = h.scheduler(&["+1001"]).run().await;

        assert_eq!(state, CampaignState::Completed);
        assert_eq!(h.channel.sent_to("+1001"), 3);
        let stats = h.tracker.snapshot();
        assert_eq!(stats.failed, 1);
        assert!(stats.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_new_batches() {
        let h = Harness::new(1, 1, 0, ScriptedChannel::delivering()).await;
        let scheduler = h.scheduler(&["+1001", "+1002", "+1003"]);
        let handle = tokio::spawn(scheduler.run());

        // first batch goes out at t=0, pause during the interval
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.tracker.transition(CampaignState::Paused).unwrap();
        h.control.paused.send_replace(true);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.channel.sent().len(), 1);

        h.tracker.transition(CampaignState::Running).unwrap();
        h.control.paused.send_replace(false);

        assert_eq!(handle.await.unwrap(), CampaignState::Completed);
        assert_eq!(h.channel.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_interval() {
        let h = Harness::new(2, 5, 0, ScriptedChannel::delivering()).await;
        let scheduler = h.scheduler(&["+1001", "+1002", "+1003", "+1004"]);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.control.cancel.cancel();

        assert_eq!(handle.await.unwrap(), CampaignState::Cancelled);
        assert_eq!(h.channel.sent().len(), 2);

        let stats = h.tracker.snapshot();
        assert_eq!((stats.delivered, stats.pending), (2, 2));
        assert!(stats.is_consistent());
        let stored = h.repository.get_campaign(h.campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CampaignState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_retries() {
        let h = Harness::new(10, 0, 3, ScriptedChannel::failing(FailureKind::Transport)).await;
        let scheduler = h.scheduler(&["+1001"]);
        let handle = tokio::spawn(scheduler.run());

        // attempt 1 at t=0, retry due at t=2
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.control.cancel.cancel();

        assert_eq!(handle.await.unwrap(), CampaignState::Cancelled);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.channel.sent_to("+1001"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_pauses_campaign() {
        let h = Harness::new(2, 1, 0, ScriptedChannel::delivering()).await;
        let repository = Arc::new(UnreliableRepository::new(FailingWrites::All));
        repository.create_campaign(&h.campaign).await.unwrap();

        let queue: VecDeque<QueuedSend> = ["+1001", "+1002", "+1003"]
            .iter()
            .map(|address| QueuedSend {
                recipient: Recipient::new(*address),
                message: "hello".to_string(),
                attempt: 1,
            })
            .collect();
        h.tracker.admit(queue.len() as u64);
        let pool = WorkerPool::new(h.channel.clone(), repository.clone(), h.metrics.clone());
        let scheduler = BatchScheduler::new(
            h.campaign.clone(),
            queue,
            RetryPolicy::new(1),
            Arc::new(pool),
            h.tracker.clone(),
            repository.clone(),
            h.metrics.clone(),
            &h.control,
        );
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.tracker.state(), CampaignState::Paused);
        assert_eq!(h.metrics.batches_total.get(), 1);
        let stored = repository.get_campaign(h.campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CampaignState::Paused);

        h.control.cancel.cancel();
        assert_eq!(handle.await.unwrap(), CampaignState::Cancelled);
        let stats = h.tracker.snapshot();
        assert_eq!(stats.pending, 3);
        assert!(stats.is_consistent());
    }
}
