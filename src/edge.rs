//! Debounced edge detection for polled boolean signals
//!
//! Doorbell buttons and presence sensors are sampled on an interval; the raw
//! samples are noisy, so transitions are only reported once per debounce
//! window.

use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;

/// A reported transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// 0 -> 1 (button pressed, device arrived)
    Rising,
    /// 1 -> 0 (device departed)
    Falling,
}

impl Edge {
    /// Event kind for a doorbell-style signal
    pub fn doorbell_kind(&self) -> Option<&'static str> {
        match self {
            Edge::Rising => Some("doorbell_press"),
            Edge::Falling => None,
        }
    }

    /// Event kind for a presence-style signal
    pub fn presence_kind(&self) -> &'static str {
        match self {
            Edge::Rising => "arrived",
            Edge::Falling => "departed",
        }
    }
}

/// Converts sampled states into debounced edges
///
/// The first observation only establishes the baseline, so a button that is
/// already held when monitoring starts never fires.
pub struct DebouncedEdgeDetector {
    previous: Option<bool>,
    last_fire: Option<f64>,
    debounce_seconds: f64,
    report_falling: bool,
    clock: Arc<dyn Clock>,
}

impl DebouncedEdgeDetector {
    pub fn new(debounce_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            previous: None,
            last_fire: None,
            debounce_seconds: debounce_seconds.max(0.0),
            report_falling: false,
            clock,
        }
    }

    /// Also report 1 -> 0 transitions
    pub fn with_falling_edges(mut self, report_falling: bool) -> Self {
        self.report_falling = report_falling;
        self
    }

    pub fn observe(&mut self, state: bool) -> Option<Edge> {
        let previous = self.previous.replace(state);
        let edge = match (previous, state) {
            (Some(false), true) => Edge::Rising,
            (Some(true), false) if self.report_falling => Edge::Falling,
            _ => return None,
        };

        let now = self.clock.now();
        if let Some(last) = self.last_fire {
            if now - last <= self.debounce_seconds {
                debug!(
                    edge = ?edge,
                    since_last = now - last,
                    "Edge suppressed by debounce"
                );
                return None;
            }
        }
        self.last_fire = Some(now);
        Some(edge)
    }

    /// Integer alarm states as returned by camera APIs (non-zero means active)
    pub fn observe_level(&mut self, level: i64) -> Option<Edge> {
        self.observe(level != 0)
    }

    /// Sampling errors pass through and leave the detector untouched
    pub fn observe_result<E>(&mut self, sample: Result<bool, E>) -> Result<Option<Edge>, E> {
        let state = sample?;
        Ok(self.observe(state))
    }

    pub fn previous_state(&self) -> Option<bool> {
        self.previous
    }

    pub fn last_fire_time(&self) -> Option<f64> {
        self.last_fire
    }
}
