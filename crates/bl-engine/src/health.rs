//! Per-campaign health monitoring
//!
//! Tracks a rolling window of send outcomes plus a consecutive-failure
//! streak, and turns threshold crossings into warning alerts or auto-pause
//! requests. An auto-pause is a request flag; the execution loop honors it
//! at its next supervision point so no in-flight send is cut mid-protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use bl_common::HealthThresholds;

/// Outcomes kept in the rolling window.
const WINDOW_SIZE: usize = 50;

/// A ban-rate warning needs at least this many outcomes before it fires.
const WARN_MIN_SAMPLE: usize = 20;

/// Action the monitor asks for after an outcome is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    None,
    Warn(String),
    Pause(String),
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    /// Rolling window, true = failure.
    window: Mutex<VecDeque<bool>>,
    consecutive_failures: AtomicU32,
    pause_requested: AtomicBool,
    ban_rate_warned: AtomicBool,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            window: Mutex::new(VecDeque::with_capacity(WINDOW_SIZE)),
            consecutive_failures: AtomicU32::new(0),
            pause_requested: AtomicBool::new(false),
            ban_rate_warned: AtomicBool::new(false),
        }
    }

    /// Record one send outcome and return the action it triggers.
    pub fn report(&self, success: bool) -> HealthSignal {
        let (ban_rate, samples) = {
            let mut window = self.window.lock();
            if window.len() == WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(!success);
            let failures = window.iter().filter(|failed| **failed).count();
            (failures as f64 / window.len() as f64, window.len())
        };

        let consecutive = if success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        };

        if success {
            if ban_rate < self.thresholds.warn_ban_rate {
                self.ban_rate_warned.store(false, Ordering::SeqCst);
            }
            return HealthSignal::None;
        }

        let min_sample = self.thresholds.min_sample as usize;

        if consecutive >= self.thresholds.pause_consec_fail {
            self.pause_requested.store(true, Ordering::SeqCst);
            return HealthSignal::Pause(format!("health: {consecutive} consecutive failures"));
        }

        if samples >= min_sample && ban_rate >= self.thresholds.pause_ban_rate {
            self.pause_requested.store(true, Ordering::SeqCst);
            return HealthSignal::Pause(format!(
                "health: ban rate {:.1}% over {} outcomes",
                ban_rate * 100.0,
                samples
            ));
        }

        if consecutive == self.thresholds.warn_consec_fail {
            return HealthSignal::Warn(format!("{consecutive} consecutive failures"));
        }

        if samples >= WARN_MIN_SAMPLE
            && ban_rate >= self.thresholds.warn_ban_rate
            && !self.ban_rate_warned.swap(true, Ordering::SeqCst)
        {
            return HealthSignal::Warn(format!(
                "ban rate {:.1}% over {} outcomes",
                ban_rate * 100.0,
                samples
            ));
        }

        HealthSignal::None
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn ban_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        let failures = window.iter().filter(|failed| **failed).count();
        failures as f64 / window.len() as f64
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Clear the window and the pause latch (used on resume).
    pub fn reset(&self) {
        self.window.lock().clear();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        self.ban_rate_warned.store(false, Ordering::SeqCst);
    }
}
