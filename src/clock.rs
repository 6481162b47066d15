//! Time source abstraction
//!
//! Gating decisions (hysteresis, debounce, quiet hours) all read "now" through
//! a [`Clock`] so that tests can drive time deterministically.

use chrono::{Local, NaiveTime, Utc};
use std::sync::{Mutex, PoisonError};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now(&self) -> f64;

    /// Local time of day, used for quiet-hours windows
    fn time_of_day(&self) -> NaiveTime;
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn time_of_day(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(f64, NaiveTime)>,
}

impl ManualClock {
    /// Create a clock at `now` (epoch seconds) and noon local time
    pub fn new(now: f64) -> Self {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN);
        Self::with_time_of_day(now, noon)
    }

    pub fn with_time_of_day(now: f64, time_of_day: NaiveTime) -> Self {
        Self {
            state: Mutex::new((now, time_of_day)),
        }
    }

    /// Move both the epoch time and the time of day forward
    pub fn advance(&self, seconds: f64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0 += seconds;
        let delta = chrono::Duration::milliseconds((seconds * 1000.0) as i64);
        state.1 = state.1.overflowing_add_signed(delta).0;
    }

    pub fn set_time_of_day(&self, time_of_day: NaiveTime) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.1 = time_of_day;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn time_of_day(&self) -> NaiveTime {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}
