//! Status Tracker - Aggregate counters and attempt history per campaign

use crate::error::CampaignError;
use bulkcast_common::types::{AttemptNumber, CampaignId, RecipientId};
use bulkcast_common::{Error, Result};
use bulkcast_storage::models::{
    AttemptStatus, Campaign, CampaignState, CampaignStats, DeliveryAttempt,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

struct TrackerState {
    stats: CampaignStats,
    in_flight: HashMap<RecipientId, AttemptNumber>,
    history: HashMap<RecipientId, Vec<DeliveryAttempt>>,
}

/// Live state of one campaign. Every update is applied under one lock so a
/// snapshot never shows a half-applied transition.
pub struct CampaignTracker {
    campaign_id: CampaignId,
    keep_history: bool,
    state: Mutex<TrackerState>,
}

impl CampaignTracker {
    /// Tracker for a campaign with nothing admitted yet
    pub fn new(campaign: &Campaign) -> Self {
        Self {
            campaign_id: campaign.id,
            keep_history: campaign.track_delivery,
            state: Mutex::new(TrackerState {
                stats: CampaignStats::empty(campaign.id, campaign.state),
                in_flight: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    /// Rebuild a tracker from persisted attempts
    pub fn from_attempts<I>(campaign: &Campaign, admitted: I, attempts: &[DeliveryAttempt]) -> Self
    where
        I: IntoIterator<Item = RecipientId>,
    {
        let tracker = Self::new(campaign);
        {
            let mut state = tracker.lock();
            state.stats = CampaignStats::from_attempts(campaign, admitted, attempts);

            for attempt in attempts.iter().filter(|a| a.campaign_id == campaign.id) {
                if matches!(attempt.status, AttemptStatus::Pending | AttemptStatus::Sent) {
                    state
                        .in_flight
                        .insert(attempt.recipient_id, attempt.attempt_number);
                }
                if tracker.keep_history {
                    state
                        .history
                        .entry(attempt.recipient_id)
                        .or_default()
                        .push(attempt.clone());
                }
            }
            for entries in state.history.values_mut() {
                entries.sort_by_key(|a| a.attempt_number);
            }
        }
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panic while holding the lock leaves counters intact; keep serving them
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    pub fn state(&self) -> CampaignState {
        self.lock().stats.state
    }

    /// Move to `next` if the lifecycle allows it; returns the previous state
    pub fn transition(&self, next: CampaignState) -> std::result::Result<CampaignState, CampaignError> {
        let mut state = self.lock();
        let current = state.stats.state;
        if !current.can_transition_to(next) {
            return Err(CampaignError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        state.stats.state = next;
        Ok(current)
    }

    /// Admit `count` recipients as pending
    pub fn admit(&self, count: u64) {
        let mut state = self.lock();
        state.stats.total_recipients += count;
        state.stats.pending += count;
        state.stats.refresh_progress();
    }

    /// Record a new attempt handed to the channel. Fails if the recipient
    /// already has an attempt in flight.
    pub fn begin_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let mut state = self.lock();
        if let Some(current) = state.in_flight.get(&attempt.recipient_id) {
            return Err(Error::InvalidState(format!(
                "recipient {} already has attempt {} in flight",
                attempt.recipient_id, current
            )));
        }

        state
            .in_flight
            .insert(attempt.recipient_id, attempt.attempt_number);
        state.stats.pending = state.stats.pending.saturating_sub(1);
        state.stats.sent += 1;
        state.stats.attempts_issued += 1;
        state.stats.attempts_in_flight += 1;

        if self.keep_history {
            state
                .history
                .entry(attempt.recipient_id)
                .or_default()
                .push(attempt.clone());
        }
        Ok(())
    }

    /// Withdraw an in-flight attempt that never reached the channel. The
    /// recipient is pending again, as if the attempt was never begun.
    pub fn abandon_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let mut state = self.lock();
        match state.in_flight.get(&attempt.recipient_id) {
            Some(number) if *number == attempt.attempt_number => {}
            _ => {
                return Err(Error::InvalidState(format!(
                    "attempt {} of recipient {} is not in flight",
                    attempt.attempt_number, attempt.recipient_id
                )));
            }
        }
        state.in_flight.remove(&attempt.recipient_id);

        let stats = &mut state.stats;
        stats.pending += 1;
        stats.sent -= 1;
        stats.attempts_issued -= 1;
        stats.attempts_in_flight -= 1;

        if let Some(history) = state.history.get_mut(&attempt.recipient_id) {
            history.retain(|a| a.attempt_number != attempt.attempt_number);
            if history.is_empty() {
                state.history.remove(&attempt.recipient_id);
            }
        }
        Ok(())
    }

    /// Record the terminal status of an in-flight attempt. Each attempt is
    /// counted once; a second report for the same attempt is rejected.
    pub fn finish_attempt(&self, attempt: &DeliveryAttempt, will_retry: bool) -> Result<()> {
        let mut state = self.lock();
        match state.in_flight.get(&attempt.recipient_id) {
            Some(number) if *number == attempt.attempt_number => {}
            _ => {
                return Err(Error::InvalidState(format!(
                    "attempt {} of recipient {} is not in flight",
                    attempt.attempt_number, attempt.recipient_id
                )));
            }
        }

        let stats = &mut state.stats;
        match attempt.status {
            AttemptStatus::Delivered => {
                stats.attempts_delivered += 1;
                stats.delivered += 1;
            }
            AttemptStatus::Failed => {
                stats.attempts_failed += 1;
                if will_retry {
                    stats.pending += 1;
                } else {
                    stats.failed += 1;
                }
            }
            AttemptStatus::Pending | AttemptStatus::Sent => {
                return Err(Error::InvalidState(format!(
                    "attempt {} of recipient {} has not finished",
                    attempt.attempt_number, attempt.recipient_id
                )));
            }
        }
        stats.sent -= 1;
        stats.attempts_in_flight -= 1;
        stats.refresh_progress();
        state.in_flight.remove(&attempt.recipient_id);

        if self.keep_history {
            if let Some(entry) = state
                .history
                .get_mut(&attempt.recipient_id)
                .and_then(|h| h.iter_mut().find(|a| a.attempt_number == attempt.attempt_number))
            {
                *entry = attempt.clone();
            }
        }
        Ok(())
    }

    /// Consistent copy of the counters
    pub fn snapshot(&self) -> CampaignStats {
        self.lock().stats.clone()
    }

    /// Attempts of one recipient in order; empty when history is not kept
    pub fn history(&self, recipient_id: RecipientId) -> Vec<DeliveryAttempt> {
        self.lock()
            .history
            .get(&recipient_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Registry of campaign trackers
#[derive(Default)]
pub struct StatusTracker {
    campaigns: RwLock<HashMap<CampaignId, Arc<CampaignTracker>>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracker, replacing any previous one for the campaign
    pub fn insert(&self, tracker: CampaignTracker) -> Arc<CampaignTracker> {
        let tracker = Arc::new(tracker);
        self.campaigns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(tracker.campaign_id(), Arc::clone(&tracker));
        tracker
    }

    pub fn get(&self, campaign_id: CampaignId) -> Option<Arc<CampaignTracker>> {
        self.campaigns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&campaign_id)
            .cloned()
    }

    pub fn snapshot(&self, campaign_id: CampaignId) -> Option<CampaignStats> {
        self.get(campaign_id).map(|tracker| tracker.snapshot())
    }

    /// Drop the tracker of a finished campaign
    pub fn remove(&self, campaign_id: CampaignId) -> Option<Arc<CampaignTracker>> {
        self.campaigns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&campaign_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkcast_storage::models::{CampaignType, FailureKind, NewCampaign};
    use pretty_assertions::assert_eq;

    fn campaign(track_delivery: bool) -> Campaign {
        let mut campaign = NewCampaign {
            name: "Tracker".to_string(),
            campaign_type: CampaignType::Broadcast,
            template: "hello".to_string(),
            batch_size: 10,
            interval_secs: 0,
            max_retries: 1,
            dedupe: true,
            track_delivery,
            scheduled_at: None,
        }
        .into_draft();
        campaign.state = CampaignState::Running;
        campaign
    }

    fn sent(campaign: &Campaign, recipient: RecipientId, number: AttemptNumber) -> DeliveryAttempt {
        let mut attempt = DeliveryAttempt::new(campaign.id, recipient, number);
        attempt.mark_sent().unwrap();
        attempt
    }

    #[test]
    fn test_counters_follow_attempts() {
        let campaign = campaign(true);
        let tracker = CampaignTracker::new(&campaign);
        tracker.admit(3);

        let (a, b) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let mut first = sent(&campaign, a, 1);
        let mut second = sent(&campaign, b, 1);
        tracker.begin_attempt(&first).unwrap();
        tracker.begin_attempt(&second).unwrap();

        let stats = tracker.snapshot();
        assert_eq!((stats.pending, stats.sent), (1, 2));
        assert!(stats.is_consistent());

        first.mark_delivered(None).unwrap();
        tracker.finish_attempt(&first, false).unwrap();
        second.mark_failed(FailureKind::Timeout, "timeout").unwrap();
        tracker.finish_attempt(&second, true).unwrap();

        let stats = tracker.snapshot();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.attempts_issued, 2);
        assert_eq!(stats.attempts_failed, 1);
        assert!(stats.is_consistent());
        assert_eq!(tracker.history(b).len(), 1);
        assert_eq!(tracker.history(b)[0].status, AttemptStatus::Failed);
    }

    #[test]
    fn test_no_concurrent_attempts_for_one_recipient() {
        let campaign = campaign(true);
        let tracker = CampaignTracker::new(&campaign);
        tracker.admit(1);

        let recipient = uuid::Uuid::new_v4();
        tracker.begin_attempt(&sent(&campaign, recipient, 1)).unwrap();
        assert!(tracker.begin_attempt(&sent(&campaign, recipient, 2)).is_err());
    }

    #[test]
    fn test_attempt_reported_once() {
        let campaign = campaign(false);
        let tracker = CampaignTracker::new(&campaign);
        tracker.admit(1);

        let mut attempt = sent(&campaign, uuid::Uuid::new_v4(), 1);
        tracker.begin_attempt(&attempt).unwrap();
        attempt.mark_failed(FailureKind::Rejected, "blocked").unwrap();

        tracker.finish_attempt(&attempt, false).unwrap();
        assert!(tracker.finish_attempt(&attempt, false).is_err());

        let stats = tracker.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.attempts_failed, 1);
        assert_eq!(stats.progress_percentage, 100.0);
        assert!(tracker.history(attempt.recipient_id).is_empty());
    }

    #[test]
    fn test_abandoned_attempt_returns_to_pending() {
        let campaign = campaign(true);
        let tracker = CampaignTracker::new(&campaign);
        tracker.admit(2);

        let recipient = uuid::Uuid::new_v4();
        let attempt = sent(&campaign, recipient, 1);
        tracker.begin_attempt(&attempt).unwrap();
        tracker.abandon_attempt(&attempt).unwrap();

        let stats = tracker.snapshot();
        assert_eq!((stats.pending, stats.sent, stats.attempts_issued), (2, 0, 0));
        assert!(stats.is_consistent());
        assert!(tracker.history(recipient).is_empty());
        assert!(tracker.abandon_attempt(&attempt).is_err());

        // the recipient can be attempted again
        tracker.begin_attempt(&attempt).unwrap();
    }

    #[test]
    fn test_transition_guard() {
        let campaign = campaign(true);
        let tracker = CampaignTracker::new(&campaign);

        assert_eq!(tracker.transition(CampaignState::Paused).unwrap(), CampaignState::Running);
        assert!(matches!(
            tracker.transition(CampaignState::Validated),
            Err(CampaignError::InvalidTransition { .. })
        ));
        tracker.transition(CampaignState::Cancelled).unwrap();
        assert!(tracker.transition(CampaignState::Running).is_err());
    }

    #[test]
    fn test_rebuild_from_attempts() {
        let campaign = campaign(true);
        let (a, b, c) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4(), uuid::Uuid::new_v4());

        let mut delivered = sent(&campaign, a, 1);
        delivered.mark_delivered(None).unwrap();
        let in_flight = sent(&campaign, b, 1);

        let tracker =
            CampaignTracker::from_attempts(&campaign, [a, b, c], &[delivered, in_flight.clone()]);
        let stats = tracker.snapshot();
        assert_eq!((stats.delivered, stats.sent, stats.pending), (1, 1, 1));
        assert!(tracker.begin_attempt(&sent(&campaign, b, 2)).is_err());

        let mut finished = in_flight;
        finished.mark_delivered(None).unwrap();
        tracker.finish_attempt(&finished, false).unwrap();
        assert_eq!(tracker.snapshot().delivered, 2);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let campaign = campaign(false);
        let tracker = Arc::new(CampaignTracker::new(&campaign));
        tracker.admit(200);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let campaign = campaign.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let mut attempt = sent(&campaign, uuid::Uuid::new_v4(), 1);
                        tracker.begin_attempt(&attempt).unwrap();
                        attempt.mark_delivered(None).unwrap();
                        tracker.finish_attempt(&attempt, false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = tracker.snapshot();
        assert_eq!(stats.delivered, 200);
        assert_eq!(stats.attempts_issued, 200);
        assert!(stats.is_consistent());
    }

    #[test]
    fn test_registry() {
        let registry = StatusTracker::new();
        let campaign = campaign(true);
        registry.insert(CampaignTracker::new(&campaign));

        assert!(registry.get(campaign.id).is_some());
        assert_eq!(registry.snapshot(campaign.id).unwrap().state, CampaignState::Running);
        assert!(registry.get(uuid::Uuid::new_v4()).is_none());

        assert!(registry.remove(campaign.id).is_some());
        assert!(registry.get(campaign.id).is_none());
        assert!(registry.snapshot(campaign.id).is_none());
    }
}
