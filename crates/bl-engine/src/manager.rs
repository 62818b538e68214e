//! Campaign manager
//!
//! Lifecycle façade over the engine: create, start, pause, resume, stop,
//! status, recover, cleanup, plus the force-start variant. Owns the
//! registry of live execution loops and the per-session connection
//! watchers. There are no ambient globals; every collaborator is passed in
//! and shared explicitly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bl_common::{
    is_digits_only, AlertSeverity, BlastMessage, Campaign, CampaignAlert, CampaignConfig,
    CampaignSnapshot, CampaignStatus, Contact, SessionEvent, EVENT_CAMPAIGN_PROGRESS,
    EVENT_SESSIONS_UPDATE,
};
use bl_pacing::{Clock, SystemClock};
use bl_store::CampaignStore;

use crate::alerts::AlertService;
use crate::broadcast::Broadcaster;
use crate::messenger::{Messenger, SessionGate};
use crate::runner::{run_campaign_loop, LoopControl, LoopHandle, LoopRegistry, RunnerContext};
use crate::{EngineError, Result};

/// `last_error` marker for campaigns paused by a session disconnect; the
/// auto-resume path keys off it.
pub const SESSION_LOST_REASON: &str = "messenger session disconnected";

/// Messages stuck in `processing` longer than this are reconciled at
/// recovery (the loop-shutdown grace).
const ZOMBIE_GRACE: Duration = Duration::from_secs(60);

/// Result of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub respawned: usize,
    pub reconciled_messages: usize,
}

struct Core {
    store: Arc<dyn CampaignStore>,
    messenger: Arc<dyn Messenger>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    gate: Arc<SessionGate>,
    alerts: Arc<AlertService>,
    loops: LoopRegistry,
    watchers: DashMap<String, JoinHandle<()>>,
    recovery_lock: Mutex<()>,
    rng_seed: Option<u64>,
    shutdown_grace: Duration,
}

/// Cheap-to-clone handle over the engine core.
#[derive(Clone)]
pub struct CampaignManager {
    core: Arc<Core>,
}

impl CampaignManager {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        messenger: Arc<dyn Messenger>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let alerts = Arc::new(AlertService::new(broadcaster.clone()));
        Self {
            core: Arc::new(Core {
                store,
                messenger,
                broadcaster,
                clock: Arc::new(SystemClock),
                gate: Arc::new(SessionGate::new()),
                alerts,
                loops: Arc::new(DashMap::new()),
                watchers: DashMap::new(),
                recovery_lock: Mutex::new(()),
                rng_seed: None,
                shutdown_grace: Duration::from_secs(60),
            }),
        }
    }

    /// Replace the clock (tests drive the engine with a manual one).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        Arc::get_mut(&mut self.core).expect("configure before sharing").clock = clock;
        self
    }

    /// Seed every random source in spawned loops for deterministic runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        Arc::get_mut(&mut self.core).expect("configure before sharing").rng_seed = Some(seed);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        Arc::get_mut(&mut self.core).expect("configure before sharing").shutdown_grace = grace;
        self
    }

    /// The per-session send gate, shared with the retry governor so loop
    /// and governor sends on one session stay serialized.
    pub fn session_gate(&self) -> Arc<SessionGate> {
        self.core.gate.clone()
    }

    pub fn active_loop_count(&self) -> usize {
        self.core.loops.len()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Persist a new campaign with one message row per contact.
    pub async fn create(
        &self,
        owner_id: &str,
        session_id: &str,
        name: &str,
        template: &str,
        contacts: Vec<Contact>,
        config: CampaignConfig,
    ) -> Result<String> {
        if contacts.is_empty() {
            return Err(EngineError::Validation("contact list is empty".to_string()));
        }
        for contact in &contacts {
            if !is_digits_only(&contact.phone) {
                return Err(EngineError::Validation(format!(
                    "phone must contain digits only: {:?}",
                    contact.phone
                )));
            }
        }

        let campaign = Campaign::new(
            owner_id,
            session_id,
            name,
            template,
            contacts.len() as u32,
            config.clone(),
        );
        let max_attempts = config
            .retry_policy
            .as_ref()
            .map(|p| p.max_attempts)
            .unwrap_or(BlastMessage::DEFAULT_MAX_ATTEMPTS);
        let messages: Vec<BlastMessage> = contacts
            .into_iter()
            .enumerate()
            .map(|(i, contact)| BlastMessage::new(&campaign.id, i as u32, contact, max_attempts))
            .collect();

        self.core.store.insert_campaign(&campaign).await?;
        self.core.store.insert_messages(&messages).await?;
        if let Some(retry_config) = config.retry_policy {
            self.core
                .store
                .upsert_retry_policy(&retry_config.into_policy(&campaign.id))
                .await?;
        }

        metrics::counter!("blast.campaigns_created_total").increment(1);
        info!(
            campaign_id = %campaign.id,
            owner_id = %owner_id,
            session_id = %session_id,
            total = campaign.total_count,
            "Campaign created"
        );
        Ok(campaign.id)
    }

    /// IDLE/STOPPED → RUNNING with the validation pass.
    pub async fn start(&self, campaign_id: &str) -> Result<()> {
        self.start_inner(campaign_id, false).await
    }

    /// Start that bypasses the business-hours and validation gates but
    /// keeps chaos, rest and health checks.
    pub async fn force_start(&self, campaign_id: &str) -> Result<()> {
        self.start_inner(campaign_id, true).await
    }

    async fn start_inner(&self, campaign_id: &str, force: bool) -> Result<()> {
        let mut campaign = self.require_campaign(campaign_id).await?;
        if !matches!(campaign.status, CampaignStatus::Idle | CampaignStatus::Stopped) {
            return Err(EngineError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Running,
            });
        }

        campaign.status = CampaignStatus::Running;
        campaign.started_at = Some(self.core.clock.now_utc());
        campaign.last_error = None;
        self.core.store.update_campaign_state(&campaign).await?;

        Core::ensure_watcher(&self.core, &campaign.session_id);
        self.core.spawn_loop(&campaign, force, true);

        info!(campaign_id = %campaign_id, force = force, "Campaign started");
        Ok(())
    }

    /// RUNNING → PAUSED; the queue is preserved.
    pub async fn pause(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.require_campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Running {
            return Err(EngineError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Paused,
            });
        }

        self.core.signal_loop(campaign_id, LoopControl::Pause).await;

        // The loop may have resolved the campaign while we waited for it.
        let mut campaign = self.require_campaign(campaign_id).await?;
        match campaign.status {
            CampaignStatus::Running => {
                campaign.status = CampaignStatus::Paused;
                campaign.paused_at = Some(self.core.clock.now_utc());
                self.core.store.update_campaign_state(&campaign).await?;
                self.core.emit_progress(&campaign);
                info!(campaign_id = %campaign_id, "Campaign paused");
                Ok(())
            }
            CampaignStatus::Paused => Ok(()),
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: CampaignStatus::Paused,
            }),
        }
    }

    /// PAUSED → RUNNING with a fresh loop; validation is not re-run.
    pub async fn resume(&self, campaign_id: &str) -> Result<()> {
        let mut campaign = self.require_campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(EngineError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Running,
            });
        }

        campaign.status = CampaignStatus::Running;
        campaign.resumed_at = Some(self.core.clock.now_utc());
        campaign.last_error = None;
        self.core.store.update_campaign_state(&campaign).await?;

        Core::ensure_watcher(&self.core, &campaign.session_id);
        self.core.spawn_loop(&campaign, false, false);

        info!(campaign_id = %campaign_id, "Campaign resumed");
        Ok(())
    }

    /// Any live state → STOPPED; no queue reset.
    pub async fn stop(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.require_campaign(campaign_id).await?;
        if campaign.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Stopped,
            });
        }

        self.core.signal_loop(campaign_id, LoopControl::Stop).await;

        let mut campaign = self.require_campaign(campaign_id).await?;
        if !campaign.status.is_terminal() {
            campaign.status = CampaignStatus::Stopped;
            campaign.stopped_at = Some(self.core.clock.now_utc());
            self.core.store.update_campaign_state(&campaign).await?;
            self.core.emit_progress(&campaign);
        }

        info!(campaign_id = %campaign_id, "Campaign stopped");
        Ok(())
    }

    pub async fn status(&self, campaign_id: &str) -> Result<CampaignSnapshot> {
        Ok(self.require_campaign(campaign_id).await?.snapshot())
    }

    /// Alerts recorded for a campaign, oldest first.
    pub fn alerts(&self, campaign_id: &str) -> Vec<CampaignAlert> {
        self.core.alerts.recent(campaign_id)
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<CampaignSnapshot>> {
        let campaigns = self.core.store.find_campaigns_by_owner(owner_id).await?;
        Ok(campaigns.iter().map(Campaign::snapshot).collect())
    }

    /// Scan for live campaigns after a process start: reconcile zombie
    /// `processing` rows, rebuild counters from the message rows, and
    /// respawn loops for RUNNING campaigns. Idempotent; a concurrent call
    /// is a no-op.
    pub async fn recover(&self, owner_id: Option<&str>) -> Result<RecoveryReport> {
        let Ok(_guard) = self.core.recovery_lock.try_lock() else {
            debug!("Recovery already in progress");
            return Ok(RecoveryReport::default());
        };

        let mut report = RecoveryReport::default();
        let campaigns = self
            .core
            .store
            .find_campaigns_by_status(&[CampaignStatus::Running, CampaignStatus::Paused])
            .await?;

        for campaign in campaigns {
            if let Some(owner) = owner_id {
                if campaign.owner_id != owner {
                    continue;
                }
            }
            report.scanned += 1;

            let cutoff = self.core.clock.now_utc()
                - chrono::Duration::from_std(ZOMBIE_GRACE).unwrap_or_else(|_| chrono::Duration::seconds(60));
            let stale = self.core.store.find_stale_processing(&campaign.id, cutoff).await?;
            for msg in stale {
                match msg.messenger_message_id {
                    // A partially persisted success: dedup on the
                    // messenger message id instead of sending again.
                    Some(ref message_id) => {
                        self.core
                            .store
                            .mark_sent(
                                &campaign.id,
                                msg.index,
                                message_id,
                                msg.rendered_text.as_deref().unwrap_or_default(),
                            )
                            .await?;
                    }
                    None => {
                        self.core.store.release(&campaign.id, msg.index).await?;
                    }
                }
                report.reconciled_messages += 1;
            }

            self.core.store.recompute_counters(&campaign.id).await?;

            if campaign.status == CampaignStatus::Running && !self.core.loops.contains_key(&campaign.id) {
                Core::ensure_watcher(&self.core, &campaign.session_id);
                let refreshed = self
                    .core
                    .store
                    .get_campaign(&campaign.id)
                    .await?
                    .unwrap_or(campaign);
                self.core.spawn_loop(&refreshed, false, false);
                report.respawned += 1;
            }
        }

        metrics::counter!("blast.recovered_total").increment(report.respawned as u64);
        info!(
            scanned = report.scanned,
            respawned = report.respawned,
            reconciled = report.reconciled_messages,
            "Recovery pass finished"
        );
        Ok(report)
    }

    /// Delete messages then the campaign. Terminal states only.
    pub async fn cleanup(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.require_campaign(campaign_id).await?;
        if !campaign.status.is_terminal() {
            return Err(EngineError::NotTerminal(campaign.status));
        }
        self.core.store.delete_campaign(campaign_id).await?;
        self.core.alerts.clear(campaign_id);
        info!(campaign_id = %campaign_id, "Campaign cleaned up");
        Ok(())
    }

    /// Signal every live loop to stop and wait for them within the grace
    /// period, then drop the session watchers.
    pub async fn shutdown(&self) {
        info!(loops = self.core.loops.len(), "Campaign manager shutting down");

        let ids: Vec<String> = self.core.loops.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.core.signal_loop(&id, LoopControl::Stop).await;
        }

        for entry in self.core.watchers.iter() {
            entry.value().abort();
        }
        self.core.watchers.clear();

        info!("Campaign manager shutdown complete");
    }

    async fn require_campaign(&self, campaign_id: &str) -> Result<Campaign> {
        self.core
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))
    }
}

impl Core {
    fn spawn_loop(&self, campaign: &Campaign, force: bool, validate_first: bool) {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (ctrl_tx, ctrl_rx) = watch::channel(LoopControl::Run);

        let ctx = RunnerContext {
            campaign_id: campaign.id.clone(),
            run_id: run_id.clone(),
            store: self.store.clone(),
            messenger: self.messenger.clone(),
            broadcaster: self.broadcaster.clone(),
            gate: self.gate.clone(),
            clock: self.clock.clone(),
            alerts: self.alerts.clone(),
            registry: self.loops.clone(),
            ctrl: ctrl_rx,
            force,
            validate_first,
            rng_seed: self.rng_seed,
        };

        let join = tokio::spawn(run_campaign_loop(ctx));
        if let Some(stale) = self.loops.insert(
            campaign.id.clone(),
            LoopHandle {
                run_id,
                ctrl: ctrl_tx,
                join,
            },
        ) {
            // A handle left behind by an earlier run must not keep sending.
            let _ = stale.ctrl.send(LoopControl::Stop);
        }
    }

    /// Remove the loop handle, deliver the signal and wait for the task
    /// within the grace period; abort past it (recovery reconciles the
    /// zombie row it may leave).
    async fn signal_loop(&self, campaign_id: &str, signal: LoopControl) {
        let Some((_, handle)) = self.loops.remove(campaign_id) else {
            return;
        };
        let _ = handle.ctrl.send(signal);

        let abort = handle.join.abort_handle();
        if tokio::time::timeout(self.shutdown_grace, handle.join).await.is_err() {
            warn!(
                campaign_id = %campaign_id,
                grace_secs = self.shutdown_grace.as_secs(),
                "Loop did not exit within the grace period, aborting"
            );
            abort.abort();
        }
    }

    fn emit_progress(&self, campaign: &Campaign) {
        self.broadcaster.emit(
            &campaign.owner_id,
            EVENT_CAMPAIGN_PROGRESS,
            serde_json::to_value(campaign.snapshot()).unwrap_or_default(),
        );
    }

    /// One watcher task per messenger session: a disconnect pauses every
    /// campaign bound to the session, a reconnect resumes the ones that
    /// opted into auto-resume.
    fn ensure_watcher(core: &Arc<Self>, session_id: &str) {
        if core.watchers.contains_key(session_id) {
            return;
        }

        let mut events = core.messenger.subscribe(session_id);
        let session = session_id.to_string();
        let watcher_core = core.clone();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Disconnected) => {
                        warn!(session_id = %session, "Messenger session disconnected");
                        if let Err(e) = watcher_core.pause_session_campaigns(&session).await {
                            error!(session_id = %session, error = %e, "Failed to pause session campaigns");
                        }
                    }
                    Ok(SessionEvent::Connected) => {
                        info!(session_id = %session, "Messenger session connected");
                        if let Err(e) = Core::auto_resume_session_campaigns(&watcher_core, &session).await {
                            error!(session_id = %session, error = %e, "Failed to auto-resume session campaigns");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session, skipped = skipped, "Session event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(session_id = %session, "Session watcher exited");
        });

        core.watchers.insert(session_id.to_string(), handle);
    }

    async fn pause_session_campaigns(&self, session_id: &str) -> Result<()> {
        let campaigns = self.store.find_campaigns_by_session(session_id).await?;
        for campaign in campaigns {
            if campaign.status != CampaignStatus::Running {
                continue;
            }

            self.signal_loop(&campaign.id, LoopControl::Pause).await;

            let Some(mut fresh) = self.store.get_campaign(&campaign.id).await? else {
                continue;
            };
            if fresh.status == CampaignStatus::Running {
                fresh.status = CampaignStatus::Paused;
                fresh.paused_at = Some(self.clock.now_utc());
                fresh.last_error = Some(SESSION_LOST_REASON.to_string());
                self.store.update_campaign_state(&fresh).await?;
            }

            self.alerts.raise(
                &campaign.owner_id,
                &campaign.id,
                AlertSeverity::Critical,
                SESSION_LOST_REASON,
            );
            self.broadcaster.emit(
                &campaign.owner_id,
                EVENT_SESSIONS_UPDATE,
                serde_json::json!({ "sessionId": session_id, "status": "disconnected" }),
            );
        }
        Ok(())
    }

    async fn auto_resume_session_campaigns(core: &Arc<Self>, session_id: &str) -> Result<()> {
        let campaigns = core.store.find_campaigns_by_session(session_id).await?;
        for campaign in campaigns {
            let paused_by_session = campaign.status == CampaignStatus::Paused
                && campaign
                    .last_error
                    .as_deref()
                    .is_some_and(|reason| reason.starts_with(SESSION_LOST_REASON));
            if !paused_by_session || !campaign.config.auto_resume {
                continue;
            }

            let mut fresh = campaign;
            fresh.status = CampaignStatus::Running;
            fresh.resumed_at = Some(core.clock.now_utc());
            fresh.last_error = None;
            core.store.update_campaign_state(&fresh).await?;
            core.spawn_loop(&fresh, false, false);

            info!(
                campaign_id = %fresh.id,
                session_id = %session_id,
                "Campaign auto-resumed after session reconnect"
            );
            core.broadcaster.emit(
                &fresh.owner_id,
                EVENT_SESSIONS_UPDATE,
                serde_json::json!({ "sessionId": session_id, "status": "connected" }),
            );
        }
        Ok(())
    }
}
