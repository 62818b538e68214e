//! Human-simulation delays
//!
//! Every send rolls a set of independent dice: distraction, app switching,
//! a long break, a typo-correction pause, plus a typing delay proportional
//! to the rendered length and a final hesitation. All durations are uniform
//! in their range.

use std::time::Duration;

use bl_common::ChaosOverrides;
use rand::Rng;

/// Probabilities and ranges for the chaos dice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChaosProfile {
    pub distraction_prob: f64,
    pub app_switch_prob: f64,
    pub long_break_prob: f64,
    pub typo_prob: f64,
    pub hesitation_ms: (u64, u64),
    /// Scales the typing delay; 0.0 disables it.
    pub typing_factor: f64,
}

impl Default for ChaosProfile {
    fn default() -> Self {
        Self {
            distraction_prob: 0.05,
            app_switch_prob: 0.05,
            long_break_prob: 0.10,
            typo_prob: 0.15,
            hesitation_ms: (500, 2000),
            typing_factor: 1.0,
        }
    }
}

impl ChaosProfile {
    pub fn resolve(overrides: Option<&ChaosOverrides>) -> Self {
        let defaults = Self::default();
        let Some(o) = overrides else {
            return defaults;
        };
        let clamp = |p: f64| p.clamp(0.0, 1.0);
        let hesitation_min = o.hesitation_min_ms.unwrap_or(defaults.hesitation_ms.0);
        let hesitation_max = o.hesitation_max_ms.unwrap_or(defaults.hesitation_ms.1).max(hesitation_min);
        Self {
            distraction_prob: clamp(o.distraction_prob.unwrap_or(defaults.distraction_prob)),
            app_switch_prob: clamp(o.app_switch_prob.unwrap_or(defaults.app_switch_prob)),
            long_break_prob: clamp(o.long_break_prob.unwrap_or(defaults.long_break_prob)),
            typo_prob: clamp(o.typo_prob.unwrap_or(defaults.typo_prob)),
            hesitation_ms: (hesitation_min, hesitation_max),
            typing_factor: o.typing_factor.unwrap_or(defaults.typing_factor).max(0.0),
        }
    }

    /// Profile with every pause zeroed.
    pub fn disabled() -> Self {
        Self {
            distraction_prob: 0.0,
            app_switch_prob: 0.0,
            long_break_prob: 0.0,
            typo_prob: 0.0,
            hesitation_ms: (0, 0),
            typing_factor: 0.0,
        }
    }

    /// Roll all per-send dice. Each roll is independent.
    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> ChaosDelays {
        let maybe = |rng: &mut R, prob: f64, min_secs: u64, max_secs: u64| {
            if prob > 0.0 && rng.random_bool(prob) {
                Some(Duration::from_secs(rng.random_range(min_secs..=max_secs)))
            } else {
                None
            }
        };

        let distraction = maybe(rng, self.distraction_prob, 30, 120);
        let app_switch = maybe(rng, self.app_switch_prob, 60, 180);
        let long_break = maybe(rng, self.long_break_prob, 5 * 60, 15 * 60);
        let typo = maybe(rng, self.typo_prob, 1, 4);

        let hesitation = if self.hesitation_ms.1 == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(self.hesitation_ms.0..=self.hesitation_ms.1))
        };

        ChaosDelays {
            distraction,
            app_switch,
            long_break,
            typo,
            hesitation,
        }
    }

    /// Typing delay proportional to the rendered message length.
    pub fn typing_delay<R: Rng + ?Sized>(&self, rendered_len: usize, rng: &mut R) -> Duration {
        if self.typing_factor <= 0.0 {
            return Duration::ZERO;
        }
        let (min_ms, max_ms) = match rendered_len {
            0..=49 => (2_000u64, 5_000u64),
            50..=150 => (5_000, 10_000),
            _ => (10_000, 20_000),
        };
        let ms = rng.random_range(min_ms..=max_ms) as f64 * self.typing_factor;
        Duration::from_millis(ms as u64)
    }
}

/// Outcome of one chaos roll; `None` means the die did not fire.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaosDelays {
    pub distraction: Option<Duration>,
    pub app_switch: Option<Duration>,
    pub long_break: Option<Duration>,
    pub typo: Option<Duration>,
    pub hesitation: Duration,
}

impl ChaosDelays {
    pub fn total(&self) -> Duration {
        self.distraction.unwrap_or(Duration::ZERO)
            + self.app_switch.unwrap_or(Duration::ZERO)
            + self.long_break.unwrap_or(Duration::ZERO)
            + self.typo.unwrap_or(Duration::ZERO)
            + self.hesitation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn disabled_profile_rolls_zero() {
        let profile = ChaosProfile::disabled();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..32 {
            assert_eq!(profile.roll(&mut rng).total(), Duration::ZERO);
            assert_eq!(profile.typing_delay(120, &mut rng), Duration::ZERO);
        }
    }

    #[test]
    fn typing_delay_scales_with_length() {
        let profile = ChaosProfile::default();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..32 {
            let short = profile.typing_delay(10, &mut rng);
            assert!(short >= Duration::from_secs(2) && short <= Duration::from_secs(5));
            let medium = profile.typing_delay(100, &mut rng);
            assert!(medium >= Duration::from_secs(5) && medium <= Duration::from_secs(10));
            let long = profile.typing_delay(500, &mut rng);
            assert!(long >= Duration::from_secs(10) && long <= Duration::from_secs(20));
        }
    }

    #[test]
    fn hesitation_always_fires_when_enabled() {
        let profile = ChaosProfile::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let delays = profile.roll(&mut rng);
            assert!(delays.hesitation >= Duration::from_millis(500));
            assert!(delays.hesitation <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn overrides_zero_individual_dice() {
        let profile = ChaosProfile::resolve(Some(&ChaosOverrides {
            long_break_prob: Some(0.0),
            ..ChaosOverrides::default()
        }));
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..256 {
            assert!(profile.roll(&mut rng).long_break.is_none());
        }
    }
}
