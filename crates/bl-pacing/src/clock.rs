//! Injectable wall-clock
//!
//! Business-window math runs on local naive time; tests drive it with a
//! manual clock instead of the system one.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Local wall-clock time, used for business-hours and daily-cap gates.
    fn local_now(&self) -> NaiveDateTime;
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock for tests. Treats the stored naive time as UTC as well,
/// which keeps `now_utc` and `local_now` coherent in a test run.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + delta;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(*self.now.lock(), Utc)
    }

    fn local_now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
