//! Per-campaign execution loop
//!
//! One task per RUNNING campaign. The loop walks the queue, applies pacing
//! and chaos, issues sends through the per-session gate, records outcomes,
//! reports to the health monitor and advances the state machine. Every
//! sleep is cancellable through the control channel; a control signal is
//! only obeyed after the current message's outcome has been persisted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bl_common::{
    AlertSeverity, CampaignStatus, SendResult, EVENT_CAMPAIGN_PROGRESS, EVENT_NOTIFICATION,
};
use bl_pacing::{Clock, PacingPlan};
use bl_store::CampaignStore;

use crate::alerts::AlertService;
use crate::broadcast::Broadcaster;
use crate::health::{HealthMonitor, HealthSignal};
use crate::messenger::{send_with_deadline, Messenger, SessionGate};
use crate::queue::CampaignQueue;
use crate::validator::PhoneValidator;
use crate::{EngineError, Result};

/// Poll cadence while waiting on in-flight work or retry backlog.
const IDLE_POLL: Duration = Duration::from_secs(5);

/// Control signal delivered to a running loop. The channel only ever moves
/// away from `Run`; a resume spawns a fresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Run,
    Pause,
    Stop,
}

/// Handle to a live execution loop, owned by the campaign manager's
/// registry.
pub struct LoopHandle {
    pub run_id: String,
    pub ctrl: watch::Sender<LoopControl>,
    pub join: JoinHandle<()>,
}

pub(crate) type LoopRegistry = Arc<DashMap<String, LoopHandle>>;

/// Sleep that wakes early when the control channel changes (or closes).
/// Returns false when interrupted.
pub(crate) async fn cancellable_sleep(duration: Duration, ctrl: &mut watch::Receiver<LoopControl>) -> bool {
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = ctrl.changed() => false,
    }
}

pub(crate) struct RunnerContext {
    pub campaign_id: String,
    pub run_id: String,
    pub store: Arc<dyn CampaignStore>,
    pub messenger: Arc<dyn Messenger>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub gate: Arc<SessionGate>,
    pub clock: Arc<dyn Clock>,
    pub alerts: Arc<AlertService>,
    pub registry: LoopRegistry,
    pub ctrl: watch::Receiver<LoopControl>,
    /// Force-start: business-hours and validation gates are disabled but
    /// chaos, rest and health checks stay on.
    pub force: bool,
    /// Run the one validation pass before sending (start, not resume).
    pub validate_first: bool,
    pub rng_seed: Option<u64>,
}

enum ExitReason {
    /// Pause/stop arrived over the control channel; the manager owns the
    /// state transition.
    Signalled,
    Completed,
    AutoPaused(String),
    /// Campaign row disappeared under the loop.
    Gone,
}

pub(crate) async fn run_campaign_loop(mut ctx: RunnerContext) {
    metrics::gauge!("blast.active_loops").increment(1.0);
    info!(campaign_id = %ctx.campaign_id, run_id = %ctx.run_id, "Execution loop started");

    match drive(&mut ctx).await {
        Ok(ExitReason::Signalled) => {
            debug!(campaign_id = %ctx.campaign_id, "Execution loop exited on control signal");
        }
        Ok(ExitReason::Gone) => {
            warn!(campaign_id = %ctx.campaign_id, "Campaign row vanished, loop exiting");
        }
        Ok(ExitReason::Completed) => {
            if let Err(e) = finalize_completed(&ctx).await {
                error!(campaign_id = %ctx.campaign_id, error = %e, "Failed to persist completion");
            }
        }
        Ok(ExitReason::AutoPaused(reason)) => {
            if let Err(e) = finalize_auto_pause(&ctx, &reason).await {
                error!(campaign_id = %ctx.campaign_id, error = %e, "Failed to persist auto-pause");
            }
        }
        Err(e) => {
            error!(campaign_id = %ctx.campaign_id, error = %e, "Execution loop failed");
            finalize_error(&ctx, &e).await;
        }
    }

    metrics::gauge!("blast.active_loops").decrement(1.0);
    ctx.registry
        .remove_if(&ctx.campaign_id, |_, handle| handle.run_id == ctx.run_id);
    info!(campaign_id = %ctx.campaign_id, run_id = %ctx.run_id, "Execution loop exited");
}

async fn drive(ctx: &mut RunnerContext) -> Result<ExitReason> {
    let Some(campaign) = ctx.store.get_campaign(&ctx.campaign_id).await? else {
        return Ok(ExitReason::Gone);
    };

    let plan = PacingPlan::resolve(&campaign.config);
    let mut rng = match ctx.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let health = HealthMonitor::new(campaign.config.health_thresholds.unwrap_or_default());
    let queue = CampaignQueue::new(
        ctx.store.clone(),
        &ctx.campaign_id,
        campaign.config.shuffle,
        ctx.rng_seed,
    );
    let governor_retries = campaign.config.retry_policy.as_ref().is_some_and(|p| p.enabled);

    // Exactly one validation pass, at start. Force-start implies skip.
    if ctx.validate_first {
        let skip = ctx.force || campaign.config.skip_phone_validation;
        let validator = match ctx.rng_seed {
            Some(seed) => PhoneValidator::with_seed(ctx.store.clone(), ctx.messenger.clone(), seed),
            None => PhoneValidator::new(ctx.store.clone(), ctx.messenger.clone()),
        };
        match validator.validate(&campaign, skip, ctx.ctrl.clone()).await {
            Ok(report) => {
                if report.total > 0 {
                    ctx.broadcaster.emit(
                        &campaign.owner_id,
                        EVENT_NOTIFICATION,
                        serde_json::json!({
                            "type": "validation-report",
                            "campaignId": ctx.campaign_id,
                            "report": report,
                        }),
                    );
                }
            }
            Err(EngineError::SessionLost(reason)) => {
                return Ok(ExitReason::AutoPaused(format!(
                    "{}: {reason}",
                    crate::manager::SESSION_LOST_REASON
                )));
            }
            Err(e) => return Err(e),
        }
        if *ctx.ctrl.borrow() != LoopControl::Run {
            return Ok(ExitReason::Signalled);
        }
    }

    let mut sent_since_rest = 0u32;
    let mut today = ctx.clock.local_now().date();
    let mut daily_cap = plan.resolve_daily_cap(&mut rng);
    let mut sent_today = 0u32;

    loop {
        if *ctx.ctrl.borrow() != LoopControl::Run {
            return Ok(ExitReason::Signalled);
        }

        let now_local = ctx.clock.local_now();
        if now_local.date() != today {
            today = now_local.date();
            sent_today = 0;
            daily_cap = plan.resolve_daily_cap(&mut rng);
        }

        // Window and cap gates are sleeps, never state transitions.
        if !ctx.force && !plan.is_within_window(now_local) {
            let reopen = plan.next_send_at(now_local);
            let wait = (reopen - now_local)
                .to_std()
                .unwrap_or(IDLE_POLL)
                .max(Duration::from_secs(1));
            debug!(
                campaign_id = %ctx.campaign_id,
                reopen = %reopen,
                "Outside business window, sleeping"
            );
            if !cancellable_sleep(wait, &mut ctx.ctrl).await {
                return Ok(ExitReason::Signalled);
            }
            continue;
        }

        if sent_today >= daily_cap {
            let tomorrow = today
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or(now_local);
            let reopen = plan.next_send_at(tomorrow);
            let wait = (reopen - now_local)
                .to_std()
                .unwrap_or(Duration::from_secs(60))
                .max(Duration::from_secs(1));
            info!(
                campaign_id = %ctx.campaign_id,
                cap = daily_cap,
                "Daily cap reached, sleeping until the next window"
            );
            if !cancellable_sleep(wait, &mut ctx.ctrl).await {
                return Ok(ExitReason::Signalled);
            }
            continue;
        }

        let batch = queue.next_batch(ctx.clock.now_utc(), 1).await?;
        let Some(msg) = batch.into_iter().next() else {
            let stats = queue.stats().await?;
            let retry_backlog = if governor_retries {
                ctx.store.count_retry_eligible(&ctx.campaign_id).await?
            } else {
                0
            };
            if stats.is_drained() && retry_backlog == 0 {
                return Ok(ExitReason::Completed);
            }
            if !cancellable_sleep(IDLE_POLL, &mut ctx.ctrl).await {
                return Ok(ExitReason::Signalled);
            }
            continue;
        };

        let rendered = bl_render::render(&campaign.template, &msg.variables, &mut rng);

        // Human simulation before the send: typing plus chaos dice.
        let typing = plan.typing_delay(rendered.chars().count(), &mut rng);
        let chaos = plan.chaos_roll(&mut rng);
        let pre_send = typing + chaos.total();
        if !pre_send.is_zero() {
            debug!(
                campaign_id = %ctx.campaign_id,
                index = msg.index,
                typing_ms = typing.as_millis() as u64,
                chaos_ms = chaos.total().as_millis() as u64,
                "Simulating typing and pauses"
            );
            if !cancellable_sleep(pre_send, &mut ctx.ctrl).await {
                // Cancelled before the send was issued: hand the item back.
                ctx.store.release(&ctx.campaign_id, msg.index).await?;
                return Ok(ExitReason::Signalled);
            }
        }

        // Serialized per messenger session; runs to completion even if a
        // control signal arrives meanwhile.
        let outcome = {
            let lock = ctx.gate.lock(&campaign.session_id);
            let _guard = lock.lock().await;
            send_with_deadline(ctx.messenger.as_ref(), &campaign.session_id, &msg.phone, &rendered).await
        };

        let success = outcome.is_ok();
        let attempts_now = msg.attempts + 1;

        match outcome.result {
            SendResult::Sent => {
                let message_id = outcome.message_id.unwrap_or_default();
                ctx.store
                    .mark_sent(&ctx.campaign_id, msg.index, &message_id, &rendered)
                    .await?;
                ctx.store
                    .increment_counters(&ctx.campaign_id, 1, 0, 0, msg.index)
                    .await?;
                metrics::counter!("blast.sends_total").increment(1);
                sent_since_rest += 1;
                sent_today += 1;
                debug!(
                    campaign_id = %ctx.campaign_id,
                    index = msg.index,
                    messenger_message_id = %message_id,
                    "Message sent"
                );
            }
            SendResult::Permanent => {
                let error = outcome.error.unwrap_or_else(|| "permanent failure".to_string());
                ctx.store
                    .mark_skipped(&ctx.campaign_id, msg.index, &error)
                    .await?;
                ctx.store
                    .increment_counters(&ctx.campaign_id, 0, 0, 1, msg.index)
                    .await?;
                metrics::counter!("blast.skips_total").increment(1);
                warn!(
                    campaign_id = %ctx.campaign_id,
                    index = msg.index,
                    error = %error,
                    "Permanent failure, message skipped"
                );
            }
            SendResult::Transient | SendResult::RateLimited => {
                let error = outcome.error.unwrap_or_else(|| "transient failure".to_string());
                metrics::counter!("blast.send_failures_total").increment(1);
                if attempts_now >= msg.max_attempts {
                    ctx.store
                        .mark_failed(&ctx.campaign_id, msg.index, &error)
                        .await?;
                    ctx.store
                        .increment_counters(&ctx.campaign_id, 0, 1, 0, msg.index)
                        .await?;
                    warn!(
                        campaign_id = %ctx.campaign_id,
                        index = msg.index,
                        attempts = attempts_now,
                        error = %error,
                        "Message failed terminally"
                    );
                } else if governor_retries {
                    // Left in `failed` for the retry governor's cron path.
                    ctx.store
                        .mark_failed(&ctx.campaign_id, msg.index, &error)
                        .await?;
                    debug!(
                        campaign_id = %ctx.campaign_id,
                        index = msg.index,
                        attempts = attempts_now,
                        "Transient failure, left for retry governor"
                    );
                } else {
                    queue
                        .requeue(&msg, ctx.clock.now_utc(), None, &error)
                        .await?;
                }
            }
        }

        // Progress is emitted before the next message is dequeued.
        if let Some(updated) = ctx.store.get_campaign(&ctx.campaign_id).await? {
            ctx.broadcaster.emit(
                &updated.owner_id,
                EVENT_CAMPAIGN_PROGRESS,
                serde_json::to_value(updated.snapshot()).unwrap_or_default(),
            );
        }

        match health.report(success) {
            HealthSignal::Warn(text) => {
                warn!(campaign_id = %ctx.campaign_id, reason = %text, "Health warning");
                ctx.alerts
                    .raise(&campaign.owner_id, &ctx.campaign_id, AlertSeverity::Warn, text);
            }
            HealthSignal::Pause(reason) => {
                return Ok(ExitReason::AutoPaused(reason));
            }
            HealthSignal::None => {}
        }

        if plan.rest_threshold > 0 && sent_since_rest >= plan.rest_threshold {
            let rest = plan.rest_duration(&mut rng);
            info!(
                campaign_id = %ctx.campaign_id,
                rest_secs = rest.as_secs(),
                "Rest threshold reached"
            );
            if !cancellable_sleep(rest, &mut ctx.ctrl).await {
                return Ok(ExitReason::Signalled);
            }
            sent_since_rest = 0;
        }

        if !cancellable_sleep(plan.inter_message_delay(&mut rng), &mut ctx.ctrl).await {
            return Ok(ExitReason::Signalled);
        }
    }
}

async fn finalize_completed(ctx: &RunnerContext) -> Result<()> {
    let Some(mut campaign) = ctx.store.get_campaign(&ctx.campaign_id).await? else {
        return Ok(());
    };
    if campaign.status != CampaignStatus::Running {
        return Ok(());
    }
    campaign.status = CampaignStatus::Completed;
    campaign.completed_at = Some(ctx.clock.now_utc());
    ctx.store.update_campaign_state(&campaign).await?;
    metrics::counter!("blast.campaigns_completed_total").increment(1);

    if let Some(updated) = ctx.store.get_campaign(&ctx.campaign_id).await? {
        info!(
            campaign_id = %ctx.campaign_id,
            sent = updated.sent_count,
            failed = updated.failed_count,
            skipped = updated.skipped_count,
            "Campaign completed"
        );
        ctx.broadcaster.emit(
            &updated.owner_id,
            EVENT_CAMPAIGN_PROGRESS,
            serde_json::to_value(updated.snapshot()).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn finalize_auto_pause(ctx: &RunnerContext, reason: &str) -> Result<()> {
    let Some(mut campaign) = ctx.store.get_campaign(&ctx.campaign_id).await? else {
        return Ok(());
    };
    if campaign.status != CampaignStatus::Running {
        return Ok(());
    }
    campaign.status = CampaignStatus::Paused;
    campaign.paused_at = Some(ctx.clock.now_utc());
    campaign.last_error = Some(reason.to_string());
    ctx.store.update_campaign_state(&campaign).await?;
    metrics::counter!("blast.auto_pauses_total").increment(1);

    warn!(campaign_id = %ctx.campaign_id, reason = %reason, "Campaign auto-paused");
    ctx.alerts
        .raise(&campaign.owner_id, &ctx.campaign_id, AlertSeverity::Critical, reason);
    ctx.broadcaster.emit(
        &campaign.owner_id,
        EVENT_CAMPAIGN_PROGRESS,
        serde_json::to_value(campaign.snapshot()).unwrap_or_default(),
    );
    Ok(())
}

/// Repository corruption is the one error class that halts the loop and
/// parks the campaign in ERROR for operator action.
async fn finalize_error(ctx: &RunnerContext, error: &EngineError) {
    let Ok(Some(mut campaign)) = ctx.store.get_campaign(&ctx.campaign_id).await else {
        return;
    };
    campaign.status = CampaignStatus::Error;
    campaign.last_error = Some(error.to_string());
    if let Err(e) = ctx.store.update_campaign_state(&campaign).await {
        error!(campaign_id = %ctx.campaign_id, error = %e, "Failed to persist ERROR state");
        return;
    }
    ctx.alerts.raise(
        &campaign.owner_id,
        &ctx.campaign_id,
        AlertSeverity::Critical,
        error.to_string(),
    );
}
