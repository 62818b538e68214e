//! Retry governor
//!
//! Periodic cron path for retry-eligible failures: every tick it walks the
//! enabled retry policies, applies the pause/window/hourly-cap gates, picks
//! a batch of stale failures oldest-first, re-renders and re-sends them.
//! Distinct from the execution loop's own requeue path; a campaign uses one
//! or the other depending on whether its retry policy is enabled.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use bl_common::{
    BlastMessage, Campaign, CampaignStatus, RetryPolicy, SendResult, EVENT_CAMPAIGN_PROGRESS,
};
use bl_pacing::Clock;
use bl_store::CampaignStore;

use crate::broadcast::Broadcaster;
use crate::messenger::{send_with_deadline, Messenger, SessionGate};
use crate::Result;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct RetryGovernorConfig {
    pub tick_interval: Duration,
    /// Randomized gap between retried items, milliseconds.
    pub item_gap_ms: (u64, u64),
}

impl Default for RetryGovernorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            item_gap_ms: (2_000, 6_000),
        }
    }
}

/// Totals for one tick or one forced run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryRunStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct RetryGovernor {
    store: Arc<dyn CampaignStore>,
    messenger: Arc<dyn Messenger>,
    broadcaster: Arc<dyn Broadcaster>,
    gate: Arc<SessionGate>,
    clock: Arc<dyn Clock>,
    config: RetryGovernorConfig,
    /// Hourly-cap limiters keyed by campaign, rebuilt when the cap changes.
    limiters: DashMap<String, (u32, Arc<DirectLimiter>)>,
    rng: Mutex<StdRng>,
    running: Arc<RwLock<bool>>,
}

impl RetryGovernor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        messenger: Arc<dyn Messenger>,
        broadcaster: Arc<dyn Broadcaster>,
        gate: Arc<SessionGate>,
        clock: Arc<dyn Clock>,
        config: RetryGovernorConfig,
    ) -> Self {
        Self {
            store,
            messenger,
            broadcaster,
            gate,
            clock,
            config,
            limiters: DashMap::new(),
            rng: Mutex::new(StdRng::from_os_rng()),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Spawn the periodic tick task.
    pub async fn start(self: Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            warn!("Retry governor already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "Starting retry governor"
        );

        let governor = self;
        tokio::spawn(async move {
            let mut ticker = interval(governor.config.tick_interval);
            // The first tick fires immediately; skip it so a fresh start
            // does not retry before the base delay has any meaning.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !*governor.running.read().await {
                    break;
                }
                if let Err(e) = governor.tick().await {
                    error!(error = %e, "Retry governor tick failed");
                }
            }
            debug!("Retry governor task exited");
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Retry governor stopped");
    }

    /// One pass over every enabled retry policy.
    pub async fn tick(&self) -> Result<RetryRunStats> {
        let policies = self.store.list_enabled_retry_policies().await?;
        let mut totals = RetryRunStats::default();

        for policy in policies {
            match self.run_policy(&policy).await {
                Ok(stats) => {
                    totals.attempted += stats.attempted;
                    totals.succeeded += stats.succeeded;
                    totals.failed += stats.failed;
                }
                Err(e) => {
                    error!(
                        campaign_id = %policy.campaign_id,
                        error = %e,
                        "Retry pass failed for campaign"
                    );
                }
            }
        }

        if totals.attempted > 0 {
            info!(
                attempted = totals.attempted,
                succeeded = totals.succeeded,
                failed = totals.failed,
                "Retry tick finished"
            );
        }
        Ok(totals)
    }

    async fn run_policy(&self, policy: &RetryPolicy) -> Result<RetryRunStats> {
        let mut stats = RetryRunStats::default();

        let Some(campaign) = self.store.get_campaign(&policy.campaign_id).await? else {
            return Ok(stats);
        };
        // Retries only drive campaigns that are actively running; a paused
        // campaign stays fully quiet.
        if campaign.status != CampaignStatus::Running {
            return Ok(stats);
        }

        let now = self.clock.now_utc();
        if policy.is_paused(now) {
            debug!(campaign_id = %policy.campaign_id, "Retry policy paused, skipping");
            return Ok(stats);
        }

        if policy.windowed_only && !Self::in_policy_window(policy, self.clock.local_now()) {
            debug!(campaign_id = %policy.campaign_id, "Outside retry window, skipping");
            return Ok(stats);
        }

        let base_delay = chrono::Duration::seconds(policy.base_delay_seconds as i64);
        let candidates = self
            .store
            .find_retry_candidates(&policy.campaign_id, now - base_delay, policy.batch_size)
            .await?;

        if candidates.is_empty() {
            return Ok(stats);
        }

        debug!(
            campaign_id = %policy.campaign_id,
            count = candidates.len(),
            "Retrying failed messages"
        );

        let limiter = self.limiter_for(&policy.campaign_id, policy.hourly_cap);

        for (i, msg) in candidates.iter().enumerate() {
            if limiter.check().is_err() {
                debug!(
                    campaign_id = %policy.campaign_id,
                    cap = policy.hourly_cap,
                    "Hourly retry cap exhausted"
                );
                break;
            }

            if i > 0 {
                let gap = {
                    let mut rng = self.rng.lock();
                    Duration::from_millis(rng.random_range(self.config.item_gap_ms.0..=self.config.item_gap_ms.1))
                };
                tokio::time::sleep(gap).await;
            }

            let outcome = self.retry_one(&campaign, msg).await?;
            stats.attempted += 1;
            if outcome {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }

        self.store
            .add_retry_totals(&policy.campaign_id, stats.attempted, stats.succeeded, stats.failed)
            .await?;
        Ok(stats)
    }

    /// Retry one message end to end. Returns true on a successful send.
    async fn retry_one(&self, campaign: &Campaign, msg: &BlastMessage) -> Result<bool> {
        if !self.store.reserve_retry(&campaign.id, msg.index).await? {
            // Lost the row to a concurrent transition.
            return Ok(false);
        }

        let rendered = {
            let mut rng = self.rng.lock();
            bl_render::render(&campaign.template, &msg.variables, &mut *rng)
        };

        let outcome = {
            let lock = self.gate.lock(&campaign.session_id);
            let _guard = lock.lock().await;
            send_with_deadline(self.messenger.as_ref(), &campaign.session_id, &msg.phone, &rendered).await
        };

        metrics::counter!("blast.retries_total").increment(1);
        let attempts_now = msg.attempts + 1;
        let success = match outcome.result {
            SendResult::Sent => {
                let message_id = outcome.message_id.unwrap_or_default();
                self.store
                    .mark_sent(&campaign.id, msg.index, &message_id, &rendered)
                    .await?;
                self.store
                    .increment_counters(&campaign.id, 1, 0, 0, msg.index)
                    .await?;
                info!(
                    campaign_id = %campaign.id,
                    index = msg.index,
                    attempts = attempts_now,
                    "Retry succeeded"
                );
                true
            }
            SendResult::Permanent => {
                let error = outcome.error.unwrap_or_else(|| "permanent failure".to_string());
                self.store.mark_skipped(&campaign.id, msg.index, &error).await?;
                self.store
                    .increment_counters(&campaign.id, 0, 0, 1, msg.index)
                    .await?;
                false
            }
            SendResult::Transient | SendResult::RateLimited => {
                let error = outcome.error.unwrap_or_else(|| "transient failure".to_string());
                self.store.mark_failed(&campaign.id, msg.index, &error).await?;
                if attempts_now >= msg.max_attempts {
                    self.store
                        .increment_counters(&campaign.id, 0, 1, 0, msg.index)
                        .await?;
                    warn!(
                        campaign_id = %campaign.id,
                        index = msg.index,
                        attempts = attempts_now,
                        "Retry exhausted the attempt budget"
                    );
                }
                false
            }
        };

        if let Some(updated) = self.store.get_campaign(&campaign.id).await? {
            self.broadcaster.emit(
                &updated.owner_id,
                EVENT_CAMPAIGN_PROGRESS,
                serde_json::to_value(updated.snapshot()).unwrap_or_default(),
            );
        }

        Ok(success)
    }

    /// Manual retry for named messages: bypasses the pause/window/cap and
    /// backoff gates but still honors message state transitions.
    pub async fn force_retry(&self, campaign_id: &str, indices: &[u32]) -> Result<RetryRunStats> {
        let mut stats = RetryRunStats::default();
        let Some(campaign) = self.store.get_campaign(campaign_id).await? else {
            return Err(crate::EngineError::CampaignNotFound(campaign_id.to_string()));
        };

        for &index in indices {
            let Some(msg) = self.store.get_message(campaign_id, index).await? else {
                continue;
            };
            if !msg.is_retry_eligible() {
                debug!(campaign_id = %campaign_id, index, "Message not retry-eligible, skipping");
                continue;
            }
            let outcome = self.retry_one(&campaign, &msg).await?;
            stats.attempted += 1;
            if outcome {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }

        self.store
            .add_retry_totals(campaign_id, stats.attempted, stats.succeeded, stats.failed)
            .await?;
        Ok(stats)
    }

    fn limiter_for(&self, campaign_id: &str, hourly_cap: u32) -> Arc<DirectLimiter> {
        let cap = hourly_cap.max(1);
        if let Some(entry) = self.limiters.get(campaign_id) {
            if entry.0 == cap {
                return entry.1.clone();
            }
        }
        let quota = Quota::per_hour(NonZeroU32::new(cap).expect("cap clamped to nonzero"));
        let limiter = Arc::new(RateLimiter::direct(quota));
        self.limiters
            .insert(campaign_id.to_string(), (cap, limiter.clone()));
        limiter
    }

    fn in_policy_window(policy: &RetryPolicy, now_local: chrono::NaiveDateTime) -> bool {
        use chrono::Datelike;
        if !policy.window_days.is_empty() && !policy.window_days.contains(&now_local.weekday()) {
            return false;
        }
        let hour = now_local.hour() as u8;
        hour >= policy.window_start_hour && hour < policy.window_end_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_common::RetryPolicyConfig;
    use chrono::NaiveDate;

    fn policy_with_window(start: u8, end: u8, days: Vec<chrono::Weekday>) -> RetryPolicy {
        RetryPolicyConfig {
            windowed_only: true,
            window_start_hour: start,
            window_end_hour: end,
            window_days: days,
            ..RetryPolicyConfig::default()
        }
        .into_policy("c1")
    }

    fn at(h: u32) -> chrono::NaiveDateTime {
        // 2026-03-02 is a Monday.
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn window_check_by_hour_and_day() {
        let policy = policy_with_window(9, 17, vec![chrono::Weekday::Mon]);
        assert!(RetryGovernor::in_policy_window(&policy, at(9)));
        assert!(RetryGovernor::in_policy_window(&policy, at(16)));
        assert!(!RetryGovernor::in_policy_window(&policy, at(8)));
        assert!(!RetryGovernor::in_policy_window(&policy, at(17)));

        let tuesday = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap().and_hms_opt(10, 0, 0).unwrap();
        assert!(!RetryGovernor::in_policy_window(&policy, tuesday));
    }

    #[test]
    fn empty_day_set_means_every_day() {
        let policy = policy_with_window(0, 24, vec![]);
        assert!(RetryGovernor::in_policy_window(&policy, at(3)));
    }
}
