//! Pacing policy
//!
//! Computes the delays, rests, daily caps and business-window gates a
//! campaign must respect, from the account-age tier defaults plus any
//! per-campaign overrides. All randomness flows through a caller-supplied
//! generator and all window math runs on an injected clock, so the policy
//! can be driven deterministically in tests.

use std::time::Duration;

use bl_common::{AccountAgeTier, BusinessHoursConfig, CampaignConfig};
use chrono::NaiveDateTime;
use rand::Rng;

pub mod chaos;
pub mod clock;
pub mod window;

pub use chaos::{ChaosDelays, ChaosProfile};
pub use clock::{Clock, ManualClock, SystemClock};
pub use window::BusinessHours;

/// Inclusive uniform delay range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DelayRange {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_secs == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rng.random_range(self.min_secs..=self.max_secs))
    }
}

/// Tier defaults from the anti-ban table. Younger accounts send slower,
/// rest more often and cap lower.
#[derive(Debug, Clone, Copy)]
struct TierDefaults {
    delay: DelayRange,
    rest_threshold: u32,
    rest_mins: (u64, u64),
    daily_cap: (u32, u32),
}

fn tier_defaults(tier: AccountAgeTier) -> TierDefaults {
    match tier {
        AccountAgeTier::New => TierDefaults {
            delay: DelayRange::new(90, 300),
            rest_threshold: 40,
            rest_mins: (60, 120),
            daily_cap: (40, 60),
        },
        AccountAgeTier::Warming => TierDefaults {
            delay: DelayRange::new(60, 180),
            rest_threshold: 60,
            rest_mins: (45, 90),
            daily_cap: (80, 120),
        },
        AccountAgeTier::Established => TierDefaults {
            delay: DelayRange::new(45, 150),
            rest_threshold: 80,
            rest_mins: (30, 60),
            daily_cap: (150, 200),
        },
    }
}

/// Fully resolved pacing parameters for one campaign.
#[derive(Debug, Clone)]
pub struct PacingPlan {
    pub delay: DelayRange,
    /// Rest after this many sends.
    pub rest_threshold: u32,
    pub rest: DelayRange,
    pub daily_cap: (u32, u32),
    pub hours: BusinessHours,
    pub respect_business_hours: bool,
    pub chaos: ChaosProfile,
}

impl PacingPlan {
    pub fn resolve(config: &CampaignConfig) -> Self {
        let defaults = tier_defaults(config.account_age);
        let overrides = config.pacing.clone().unwrap_or_default();

        let delay = DelayRange::new(
            overrides.delay_min_secs.unwrap_or(defaults.delay.min_secs),
            overrides.delay_max_secs.unwrap_or(defaults.delay.max_secs),
        );
        let rest = DelayRange::new(
            overrides.rest_min_mins.unwrap_or(defaults.rest_mins.0) * 60,
            overrides.rest_max_mins.unwrap_or(defaults.rest_mins.1) * 60,
        );
        let cap_min = overrides.daily_cap_min.unwrap_or(defaults.daily_cap.0);
        let cap_max = overrides.daily_cap_max.unwrap_or(defaults.daily_cap.1).max(cap_min);

        let hours_config = config.business_hours.clone().unwrap_or_else(BusinessHoursConfig::default);

        Self {
            delay,
            rest_threshold: overrides.rest_threshold.unwrap_or(defaults.rest_threshold),
            rest,
            daily_cap: (cap_min, cap_max),
            hours: BusinessHours::resolve(&hours_config),
            respect_business_hours: config.respect_business_hours,
            chaos: ChaosProfile::resolve(config.chaos.as_ref()),
        }
    }

    pub fn inter_message_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.delay.sample(rng)
    }

    pub fn rest_duration<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.rest.sample(rng)
    }

    /// Draw the cap for one campaign-day.
    pub fn resolve_daily_cap<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.daily_cap.1 == 0 {
            return u32::MAX;
        }
        rng.random_range(self.daily_cap.0..=self.daily_cap.1)
    }

    /// Window gate; always open when business hours are not respected.
    pub fn is_within_window(&self, now: NaiveDateTime) -> bool {
        !self.respect_business_hours || self.hours.is_within(now)
    }

    /// The next instant a send is permitted at or after `now`.
    pub fn next_send_at(&self, now: NaiveDateTime) -> NaiveDateTime {
        if !self.respect_business_hours {
            return now;
        }
        self.hours.next_open(now)
    }

    pub fn typing_delay<R: Rng + ?Sized>(&self, rendered_len: usize, rng: &mut R) -> Duration {
        self.chaos.typing_delay(rendered_len, rng)
    }

    pub fn chaos_roll<R: Rng + ?Sized>(&self, rng: &mut R) -> ChaosDelays {
        self.chaos.roll(rng)
    }
}
