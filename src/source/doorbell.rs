//! 门铃来源：厂商驱动采样 + 去抖边沿检测

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EventSource, RawEvent};
use crate::clock::Clock;
use crate::edge::DebouncedEdgeDetector;
use crate::event::SourceKind;
use crate::vendor::DoorbellDriver;

pub struct DoorbellSource {
    driver: Box<dyn DoorbellDriver>,
    detector: DebouncedEdgeDetector,
    clock: Arc<dyn Clock>,
    logged_in: bool,
    consecutive_failures: u32,
}

impl DoorbellSource {
    pub fn new(driver: Box<dyn DoorbellDriver>, debounce_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            detector: DebouncedEdgeDetector::new(debounce_seconds, clock.clone()),
            clock,
            logged_in: false,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        // 下次轮询前重新登录
        self.logged_in = false;
    }
}

impl EventSource for DoorbellSource {
    fn name(&self) -> &str {
        self.driver.name()
    }

    fn poll(&mut self) -> Result<Option<RawEvent>> {
        if !self.logged_in {
            if let Err(e) = self.driver.login() {
                self.record_failure();
                return Err(e);
            }
            self.logged_in = true;
        }

        let sample = self.driver.sample_state();
        let edge = match self.detector.observe_result(sample) {
            Ok(edge) => edge,
            Err(e) => {
                self.record_failure();
                warn!(
                    doorbell = %self.driver.name(),
                    failures = self.consecutive_failures,
                    "Doorbell sampling failed, will log in again"
                );
                return Err(e);
            }
        };
        self.consecutive_failures = 0;

        let Some(edge) = edge else {
            return Ok(None);
        };
        if edge.doorbell_kind().is_none() {
            return Ok(None);
        }

        info!(doorbell = %self.driver.name(), "Doorbell button pressed");
        let payload = self.driver.normalize(edge, self.clock.now());
        Ok(Some(RawEvent::payload(SourceKind::CameraApi, payload.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::edge::Edge;
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDriver {
        samples: VecDeque<Result<bool>>,
        logins: Arc<AtomicUsize>,
        fail_login: bool,
    }

    impl DoorbellDriver for ScriptedDriver {
        fn name(&self) -> &str {
            "front"
        }

        fn login(&mut self) -> Result<()> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        }

        fn sample_state(&mut self) -> Result<bool> {
            self.samples.pop_front().unwrap_or(Ok(false))
        }

        fn normalize(&self, edge: Edge, at: f64) -> Value {
            json!({"camera": "front", "event": edge.doorbell_kind(), "phase": "new", "time": at})
        }
    }

    fn source(samples: Vec<Result<bool>>, fail_login: bool) -> (DoorbellSource, Arc<AtomicUsize>, Arc<ManualClock>) {
        let logins = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(1000.0));
        let driver = ScriptedDriver {
            samples: samples.into(),
            logins: logins.clone(),
            fail_login,
        };
        (DoorbellSource::new(Box::new(driver), 5.0, clock.clone()), logins, clock)
    }

    #[test]
    fn test_press_emits_camera_payload() {
        let (mut src, logins, _) = source(vec![Ok(false), Ok(true), Ok(true)], false);
        assert!(src.poll().unwrap().is_none());
        match src.poll().unwrap() {
            Some(RawEvent::Payload { source, payload }) => {
                assert_eq!(source, SourceKind::CameraApi);
                assert!(payload.contains("doorbell_press"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // 按住不放不重复触发
        assert!(src.poll().unwrap().is_none());
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sampling_error_triggers_relogin() {
        let (mut src, logins, _) = source(vec![Ok(false), Err(anyhow!("timeout")), Ok(true)], false);
        assert!(src.poll().unwrap().is_none());
        assert!(src.poll().is_err());
        assert_eq!(src.consecutive_failures(), 1);

        // 错误不影响检测器状态，下一次采样仍是上升沿
        assert!(src.poll().unwrap().is_some());
        assert_eq!(logins.load(Ordering::SeqCst), 2);
        assert_eq!(src.consecutive_failures(), 0);
    }

    #[test]
    fn test_login_failure_is_reported() {
        let (mut src, logins, _) = source(vec![Ok(true)], true);
        assert!(src.poll().is_err());
        assert!(src.poll().is_err());
        assert_eq!(logins.load(Ordering::SeqCst), 2);
        assert_eq!(src.consecutive_failures(), 2);
    }

    #[test]
    fn test_debounce_between_presses() {
        let (mut src, _, clock) =
            source(vec![Ok(false), Ok(true), Ok(false), Ok(true), Ok(false), Ok(true)], false);
        src.poll().unwrap();
        assert!(src.poll().unwrap().is_some());
        clock.advance(1.0);
        src.poll().unwrap();
        assert!(src.poll().unwrap().is_none());
        clock.advance(10.0);
        src.poll().unwrap();
        assert!(src.poll().unwrap().is_some());
    }
}
