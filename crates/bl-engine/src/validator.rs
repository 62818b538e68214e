//! Phone validation
//!
//! Verifies pending numbers through the messenger one at a time with a
//! randomized 3-5 s gap between lookups. The sequential spacing is an
//! anti-detection requirement, so there is deliberately no parallel
//! fan-out here. Numbers that are not on the platform are persisted as
//! terminal failures with the campaign's failed counter bumped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use bl_common::{Campaign, ValidationDetail, ValidationReport};
use bl_store::CampaignStore;

use crate::messenger::{lookup_with_deadline, Messenger};
use crate::runner::{cancellable_sleep, LoopControl};
use crate::{EngineError, Result};

/// Gap between consecutive lookups, milliseconds.
const LOOKUP_GAP_MS: (u64, u64) = (3_000, 5_000);

pub struct PhoneValidator {
    store: Arc<dyn CampaignStore>,
    messenger: Arc<dyn Messenger>,
    rng: Mutex<StdRng>,
}

impl PhoneValidator {
    pub fn new(store: Arc<dyn CampaignStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            store,
            messenger,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(store: Arc<dyn CampaignStore>, messenger: Arc<dyn Messenger>, seed: u64) -> Self {
        Self {
            store,
            messenger,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Validate the campaign's pending numbers. `skip` returns an empty
    /// report (forced start). A pause/stop signal ends the pass early with
    /// the numbers processed so far; only a session loss propagates.
    pub async fn validate(
        &self,
        campaign: &Campaign,
        skip: bool,
        mut ctrl: watch::Receiver<LoopControl>,
    ) -> Result<ValidationReport> {
        if skip {
            debug!(campaign_id = %campaign.id, "Phone validation skipped");
            return Ok(ValidationReport::empty());
        }

        let pending = self
            .store
            .list_pending(&campaign.id, chrono::Utc::now(), u32::MAX)
            .await?;

        info!(
            campaign_id = %campaign.id,
            count = pending.len(),
            "Validating phone numbers sequentially"
        );

        let mut details = Vec::with_capacity(pending.len());
        let mut valid = 0u32;
        let mut invalid = 0u32;

        for (i, msg) in pending.iter().enumerate() {
            if i > 0 {
                let gap = {
                    let mut rng = self.rng.lock();
                    Duration::from_millis(rng.random_range(LOOKUP_GAP_MS.0..=LOOKUP_GAP_MS.1))
                };
                if !cancellable_sleep(gap, &mut ctrl).await {
                    debug!(campaign_id = %campaign.id, "Validation interrupted by control signal");
                    break;
                }
            }

            let (exists, error) =
                match lookup_with_deadline(self.messenger.as_ref(), &campaign.session_id, &msg.phone).await {
                    Ok(exists) => (exists, None),
                    Err(EngineError::SessionLost(reason)) => {
                        return Err(EngineError::SessionLost(reason));
                    }
                    Err(e) => {
                        warn!(
                            campaign_id = %campaign.id,
                            phone = %msg.phone,
                            error = %e,
                            "Lookup failed, counting number as invalid"
                        );
                        (false, Some(e.to_string()))
                    }
                };

            if exists {
                valid += 1;
                details.push(ValidationDetail {
                    index: msg.index,
                    phone: msg.phone.clone(),
                    exists: true,
                    error: None,
                });
            } else {
                invalid += 1;
                self.store
                    .mark_failed_terminal(&campaign.id, msg.index, "not on messenger")
                    .await?;
                self.store
                    .increment_counters(&campaign.id, 0, 1, 0, msg.index)
                    .await?;
                details.push(ValidationDetail {
                    index: msg.index,
                    phone: msg.phone.clone(),
                    exists: false,
                    error: error.or_else(|| Some("not on messenger".to_string())),
                });
            }
        }

        let total = valid + invalid;
        let valid_rate = if total == 0 { 1.0 } else { f64::from(valid) / f64::from(total) };
        let report = ValidationReport {
            total,
            valid,
            invalid,
            details,
            recommendation: ValidationReport::recommendation_for(valid_rate).to_string(),
        };

        info!(
            campaign_id = %campaign.id,
            valid = report.valid,
            invalid = report.invalid,
            recommendation = %report.recommendation,
            "Phone validation finished"
        );

        Ok(report)
    }
}
