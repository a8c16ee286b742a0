//! Campaign Engine - Lifecycle control surface and stats query

use crate::channel::ChannelAdapter;
use crate::dedup::dedup_recipients;
use crate::error::CampaignError;
use crate::metrics::EngineMetrics;
use crate::queue::{build_queue, render_message, QueuedSend};
use crate::retry::RetryPolicy;
use crate::scheduler::{apply_transition, pending_start, BatchScheduler, RunControl};
use crate::template::TemplateRenderer;
use crate::tracker::{CampaignTracker, StatusTracker};
use crate::validator::CampaignValidator;
use crate::worker::WorkerPool;
use bulkcast_common::config::DispatchConfig;
use bulkcast_common::types::{CampaignId, RecipientId};
use bulkcast_storage::models::{
    AttemptStatus, Campaign, CampaignState, CampaignStats, DeliveryAttempt, FailureKind,
    NewCampaign, Recipient,
};
use bulkcast_storage::repository::CampaignRepository;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type EngineResult<T> = std::result::Result<T, CampaignError>;

type Runs = Arc<Mutex<HashMap<CampaignId, CampaignRun>>>;

struct CampaignRun {
    control: RunControl,
    handle: Option<JoinHandle<CampaignState>>,
}

/// Lifecycle command locks, one per campaign
#[derive(Default)]
struct CampaignLocks {
    locks: Mutex<HashMap<CampaignId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CampaignLocks {
    async fn acquire(&self, id: CampaignId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Locks nobody holds or waits for
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }
}

/// Campaign engine - runs every campaign as an independent scheduler task
pub struct CampaignEngine {
    repository: Arc<dyn CampaignRepository>,
    pool: Arc<WorkerPool>,
    tracker: Arc<StatusTracker>,
    metrics: Arc<EngineMetrics>,
    config: DispatchConfig,
    runs: Runs,
    locks: CampaignLocks,
}

impl CampaignEngine {
    /// Create a new campaign engine
    pub fn new(
        repository: Arc<dyn CampaignRepository>,
        channel: Arc<dyn ChannelAdapter>,
        config: DispatchConfig,
    ) -> bulkcast_common::Result<Self> {
        let metrics = Arc::new(EngineMetrics::new()?);
        let pool = WorkerPool::new(channel, Arc::clone(&repository), Arc::clone(&metrics))
            .with_concurrency_limit(config.concurrency)
            .with_send_timeout(Duration::from_secs(config.send_timeout_secs));

        Ok(Self {
            repository,
            pool: Arc::new(pool),
            tracker: Arc::new(StatusTracker::new()),
            metrics,
            config,
            runs: Arc::new(Mutex::new(HashMap::new())),
            locks: CampaignLocks::default(),
        })
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<CampaignId, CampaignRun>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load(&self, id: CampaignId) -> EngineResult<Campaign> {
        self.repository
            .get_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound(id))
    }

    /// Store a draft campaign with its recipients
    pub async fn create_campaign(
        &self,
        new: NewCampaign,
        recipients: Vec<Recipient>,
    ) -> EngineResult<Campaign> {
        let mut campaign = new.into_draft();
        campaign.total_recipients = recipients.len() as i32;

        self.repository.create_campaign(&campaign).await?;
        self.repository
            .save_recipients(campaign.id, &recipients)
            .await?;

        info!(
            campaign_id = %campaign.id,
            campaign_type = %campaign.campaign_type,
            recipients = recipients.len(),
            "Campaign created"
        );
        Ok(campaign)
    }

    /// Campaign with its current lifecycle state
    pub async fn get_campaign(&self, id: CampaignId) -> EngineResult<Campaign> {
        let mut campaign = self.load(id).await?;
        if let Some(tracker) = self.tracker.get(id) {
            campaign.state = tracker.state();
        }
        Ok(campaign)
    }

    /// Validate and start dispatching a draft campaign. Starting a campaign
    /// that already left `draft` returns its current state.
    pub async fn start(&self, id: CampaignId) -> EngineResult<CampaignState> {
        let _guard = self.locks.acquire(id).await;

        if let Some(tracker) = self.tracker.get(id) {
            return Ok(tracker.state());
        }

        let campaign = self.load(id).await?;
        match campaign.state {
            CampaignState::Draft => {}
            CampaignState::Validated | CampaignState::Running | CampaignState::Paused => {
                // Left behind by a previous process
                self.resume_run(campaign).await?;
                return Ok(self.tracker.get(id).map_or(CampaignState::Running, |t| t.state()));
            }
            state => return Ok(state),
        }

        let recipients = self.repository.load_recipients(id).await?;
        let built = CampaignValidator::validate(&campaign, &recipients).and_then(|validated| {
            let queue = build_queue(&validated, recipients)?;
            Ok((validated, queue))
        });
        let (validated, queue) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!(campaign_id = %id, "Campaign rejected: {}", e);
                self.repository
                    .update_campaign_state(id, CampaignState::Failed)
                    .await?;
                return Err(e);
            }
        };

        self.repository
            .update_campaign_state(id, CampaignState::Validated)
            .await?;
        self.repository
            .set_total_recipients(id, queue.len() as i32)
            .await?;

        let mut campaign = validated.into_inner();
        campaign.total_recipients = queue.len() as i32;

        let tracker = self.tracker.insert(CampaignTracker::new(&campaign));
        tracker.admit(queue.len() as u64);

        if pending_start(&campaign).is_none() {
            apply_transition(
                &tracker,
                self.repository.as_ref(),
                &self.metrics,
                CampaignState::Running,
            )
            .await?;
        }

        info!(campaign_id = %id, admitted = queue.len(), "Campaign started");
        self.spawn_run(campaign, queue, tracker, false);
        Ok(self.tracker.get(id).map_or(CampaignState::Running, |t| t.state()))
    }

    /// Stop emitting batches; the batch in flight completes
    pub async fn pause(&self, id: CampaignId) -> EngineResult<CampaignState> {
        let _guard = self.locks.acquire(id).await;

        let Some(tracker) = self.tracker.get(id) else {
            let campaign = self.load(id).await?;
            return match campaign.state {
                CampaignState::Paused => Ok(CampaignState::Paused),
                from => Err(CampaignError::InvalidTransition {
                    from,
                    to: CampaignState::Paused,
                }),
            };
        };

        match tracker.state() {
            CampaignState::Paused => Ok(CampaignState::Paused),
            from if from.can_transition_to(CampaignState::Paused) => {
                // The scheduler stops before the state write is awaited
                self.signal_pause(id, true);
                if let Err(e) = apply_transition(
                    &tracker,
                    self.repository.as_ref(),
                    &self.metrics,
                    CampaignState::Paused,
                )
                .await
                {
                    self.signal_pause(id, false);
                    return Err(e);
                }
                Ok(CampaignState::Paused)
            }
            from => Err(CampaignError::InvalidTransition {
                from,
                to: CampaignState::Paused,
            }),
        }
    }

    /// Continue a paused campaign
    pub async fn resume(&self, id: CampaignId) -> EngineResult<CampaignState> {
        let _guard = self.locks.acquire(id).await;

        let Some(tracker) = self.tracker.get(id) else {
            let campaign = self.load(id).await?;
            return match campaign.state {
                CampaignState::Running => Ok(CampaignState::Running),
                from => Err(CampaignError::InvalidTransition {
                    from,
                    to: CampaignState::Running,
                }),
            };
        };

        match tracker.state() {
            CampaignState::Running => Ok(CampaignState::Running),
            CampaignState::Paused => {
                apply_transition(&tracker, self.repository.as_ref(), &self.metrics, CampaignState::Running)
                    .await?;
                self.signal_pause(id, false);
                Ok(CampaignState::Running)
            }
            from => Err(CampaignError::InvalidTransition {
                from,
                to: CampaignState::Running,
            }),
        }
    }

    /// Request cancellation. No batch is emitted after this returns; the
    /// campaign becomes `cancelled` once in-flight sends drain.
    pub async fn cancel(&self, id: CampaignId) -> EngineResult<CampaignState> {
        let _guard = self.locks.acquire(id).await;

        let Some(tracker) = self.tracker.get(id) else {
            let campaign = self.load(id).await?;
            if campaign.state.is_terminal() {
                return Ok(campaign.state);
            }
            if !campaign.state.can_transition_to(CampaignState::Cancelled) {
                return Err(CampaignError::InvalidTransition {
                    from: campaign.state,
                    to: CampaignState::Cancelled,
                });
            }
            self.repository
                .update_campaign_state(id, CampaignState::Cancelled)
                .await?;
            return Ok(CampaignState::Cancelled);
        };

        let state = tracker.state();
        if state.is_terminal() {
            return Ok(state);
        }

        if let Some(run) = self.runs().get(&id) {
            info!(campaign_id = %id, "Cancelling campaign");
            run.control.cancel.cancel();
        }
        Ok(tracker.state())
    }

    /// Current counters of a campaign
    pub async fn stats(&self, id: CampaignId) -> EngineResult<CampaignStats> {
        if let Some(stats) = self.tracker.snapshot(id) {
            return Ok(stats);
        }

        let campaign = self.load(id).await?;
        let admitted: Vec<RecipientId> = match campaign.state {
            CampaignState::Draft | CampaignState::Failed => Vec::new(),
            _ => dedup_recipients(self.repository.load_recipients(id).await?, campaign.dedupe)
                .into_iter()
                .map(|r| r.id)
                .collect(),
        };
        let attempts = self.repository.list_attempts(id).await?;
        Ok(CampaignStats::from_attempts(&campaign, admitted, &attempts))
    }

    /// Attempts of one recipient, oldest first. Empty unless the campaign
    /// tracks delivery.
    pub async fn attempt_history(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> EngineResult<Vec<DeliveryAttempt>> {
        if let Some(tracker) = self.tracker.get(campaign_id) {
            return Ok(tracker.history(recipient_id));
        }

        let campaign = self.load(campaign_id).await?;
        if !campaign.track_delivery {
            return Ok(Vec::new());
        }

        let mut attempts: Vec<DeliveryAttempt> = self
            .repository
            .list_attempts(campaign_id)
            .await?
            .into_iter()
            .filter(|a| a.recipient_id == recipient_id)
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    /// Resume every campaign a previous process left unfinished
    pub async fn restore(&self) -> EngineResult<usize> {
        let campaigns = self
            .repository
            .list_campaigns_by_state(&[
                CampaignState::Validated,
                CampaignState::Running,
                CampaignState::Paused,
            ])
            .await?;

        let mut restored = 0;
        for campaign in campaigns {
            let _guard = self.locks.acquire(campaign.id).await;
            if self.tracker.get(campaign.id).is_some() {
                continue;
            }

            let campaign_id = campaign.id;
            match self.resume_run(campaign).await {
                Ok(()) => restored += 1,
                Err(e) => error!(%campaign_id, "Failed to restore campaign: {}", e),
            }
        }

        if restored > 0 {
            info!(restored, "Restored unfinished campaigns");
        }
        Ok(restored)
    }

    /// Wait for the scheduler of a campaign to finish. Without a scheduler
    /// to wait for, returns the stored state.
    pub async fn wait(&self, id: CampaignId) -> Option<CampaignState> {
        let handle = self.runs().get_mut(&id).and_then(|run| run.handle.take());
        let Some(handle) = handle else {
            return match self.repository.get_campaign(id).await {
                Ok(campaign) => campaign.map(|c| c.state),
                Err(e) => {
                    error!(campaign_id = %id, "Failed to load campaign: {}", e);
                    None
                }
            };
        };

        match handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!(campaign_id = %id, "Scheduler task failed: {}", e);
                None
            }
        }
    }

    fn signal_pause(&self, id: CampaignId, paused: bool) {
        if let Some(run) = self.runs().get(&id) {
            run.control.paused.send_replace(paused);
        }
    }

    fn spawn_run(
        &self,
        campaign: Campaign,
        queue: VecDeque<QueuedSend>,
        tracker: Arc<CampaignTracker>,
        paused: bool,
    ) {
        let id = campaign.id;
        let control = RunControl::new(paused);
        let policy = RetryPolicy::for_campaign(&campaign, &self.config);
        let scheduler = BatchScheduler::new(
            campaign,
            queue,
            policy,
            Arc::clone(&self.pool),
            tracker,
            Arc::clone(&self.repository),
            Arc::clone(&self.metrics),
            &control,
        );

        let trackers = Arc::clone(&self.tracker);
        let finished: Runs = Arc::clone(&self.runs);

        // Registered before the task can finish and evict itself
        let mut runs = self.runs();
        let handle = tokio::spawn(async move {
            let state = scheduler.run().await;
            if state.is_terminal() {
                trackers.remove(id);
                finished
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
                debug!(campaign_id = %id, state = %state, "Campaign evicted");
            }
            state
        });
        runs.insert(
            id,
            CampaignRun {
                control,
                handle: Some(handle),
            },
        );
    }

    /// Rebuild tracker and queue of a campaign from persisted attempts and
    /// continue dispatching it
    async fn resume_run(&self, campaign: Campaign) -> EngineResult<()> {
        let id = campaign.id;
        let recipients =
            dedup_recipients(self.repository.load_recipients(id).await?, campaign.dedupe);
        let mut attempts = self.repository.list_attempts(id).await?;

        for attempt in attempts.iter_mut().filter(|a| !a.status.is_terminal()) {
            attempt.mark_failed(FailureKind::Interrupted, "interrupted before completion")?;
            self.repository.record_attempt(attempt).await?;
        }

        let tracker = self.tracker.insert(CampaignTracker::from_attempts(
            &campaign,
            recipients.iter().map(|r| r.id),
            &attempts,
        ));

        let max_attempts = campaign.max_attempts();
        let mut latest: HashMap<RecipientId, &DeliveryAttempt> = HashMap::new();
        for attempt in &attempts {
            let newer = latest
                .get(&attempt.recipient_id)
                .map_or(true, |current| attempt.attempt_number > current.attempt_number);
            if newer {
                latest.insert(attempt.recipient_id, attempt);
            }
        }

        let renderer = TemplateRenderer::new(campaign.template.as_str());
        let mut queue = VecDeque::new();
        for recipient in recipients {
            let next_attempt = match latest.get(&recipient.id) {
                None => Some(1),
                Some(a) if a.status == AttemptStatus::Delivered => None,
                Some(a) if a.is_final_failure(max_attempts) => None,
                Some(a) => Some(a.attempt_number + 1),
            };

            if let Some(attempt) = next_attempt {
                let message = render_message(&campaign, &renderer, &recipient)?;
                queue.push_back(QueuedSend {
                    recipient,
                    message,
                    attempt,
                });
            }
        }

        if campaign.state == CampaignState::Running {
            self.metrics.campaigns_running.inc();
        }
        info!(
            campaign_id = %id,
            state = %campaign.state,
            requeued = queue.len(),
            "Resuming campaign"
        );

        let paused = campaign.state == CampaignState::Paused;
        self.spawn_run(campaign, queue, tracker, paused);
        Ok(())
    }
}
