//! Business-hours window math
//!
//! The window is pure calendar arithmetic on local naive time; waiting for
//! the window to open is a sleep in the execution loop, never a state
//! transition.

use bl_common::BusinessHoursConfig;
use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};

/// Resolved send window: `[start_hour, end_hour)` local, optional lunch
/// exclusion, optional weekend exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub lunch: Option<(u32, u32)>,
    pub exclude_weekends: bool,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self::resolve(&BusinessHoursConfig::default())
    }
}

impl BusinessHours {
    pub fn resolve(config: &BusinessHoursConfig) -> Self {
        let start_hour = u32::from(config.start_hour.min(23));
        let end_hour = u32::from(config.end_hour.min(24)).max(start_hour);
        let lunch = match (config.lunch_start, config.lunch_end) {
            (Some(start), Some(end)) if start < end => {
                Some((u32::from(start.min(23)), u32::from(end.min(24))))
            }
            _ => None,
        };
        Self {
            start_hour,
            end_hour,
            lunch,
            exclude_weekends: config.exclude_weekends,
        }
    }

    fn is_working_day(&self, weekday: Weekday) -> bool {
        !(self.exclude_weekends && matches!(weekday, Weekday::Sat | Weekday::Sun))
    }

    pub fn is_within(&self, now: NaiveDateTime) -> bool {
        if !self.is_working_day(now.weekday()) {
            return false;
        }
        let hour = now.hour();
        if hour < self.start_hour || hour >= self.end_hour {
            return false;
        }
        if let Some((lunch_start, lunch_end)) = self.lunch {
            if hour >= lunch_start && hour < lunch_end {
                return false;
            }
        }
        true
    }

    /// The next instant at or after `now` when sending is permitted.
    pub fn next_open(&self, now: NaiveDateTime) -> NaiveDateTime {
        if self.is_within(now) {
            return now;
        }

        let mut date = now.date();
        for day_offset in 0..=7 {
            if day_offset > 0 {
                date = match date.succ_opt() {
                    Some(d) => d,
                    None => return now,
                };
            }
            if !self.is_working_day(date.weekday()) {
                continue;
            }

            let open = date.and_hms_opt(self.start_hour, 0, 0).expect("clamped hour");

            if day_offset == 0 {
                if now < open {
                    return open;
                }
                if let Some((lunch_start, lunch_end)) = self.lunch {
                    let hour = now.hour();
                    if hour >= lunch_start && hour < lunch_end && lunch_end < self.end_hour {
                        return date.and_hms_opt(lunch_end, 0, 0).expect("clamped hour");
                    }
                }
                // Past today's window: keep walking forward.
                continue;
            }

            return open;
        }

        // Degenerate configuration with no reachable window.
        now
    }
}
