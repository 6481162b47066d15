//! 通知迟滞器 - 同一 (subject, kind) 在最小间隔内只通知一次
//!
//! 与去重不同，这里不比较内容：
//! 1. 只有确认发送成功后才调用 `record`
//! 2. `can_notify` 是纯查询，不修改状态
//! 3. 记录永不过期，只能整体清空

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::clock::{Clock, SystemClock};

/// 线程安全的迟滞状态
pub struct HysteresisTracker {
    /// (subject, kind) -> 上次通知时间（epoch 秒）
    last_notified: Mutex<HashMap<(String, String), f64>>,
    clock: Arc<dyn Clock>,
}

impl HysteresisTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_notified: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// 是否允许通知
    ///
    /// 没有记录，或距离上次通知 `>= min_interval` 秒（含边界）时返回 `true`
    pub fn can_notify(&self, subject: &str, kind: &str, min_interval: f64) -> bool {
        let now = self.clock.now();
        let map = self
            .last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match map.get(&(subject.to_string(), kind.to_string())) {
            None => true,
            Some(last) => {
                let elapsed = now - last;
                if elapsed >= min_interval {
                    true
                } else {
                    debug!(
                        subject = %subject,
                        kind = %kind,
                        elapsed_secs = %format!("{:.1}", elapsed),
                        min_interval = %min_interval,
                        "Within hysteresis window"
                    );
                    false
                }
            }
        }
    }

    /// 记录一次成功通知
    pub fn record(&self, subject: &str, kind: &str) {
        let now = self.clock.now();
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((subject.to_string(), kind.to_string()), now);
    }

    pub fn last_notified(&self, subject: &str, kind: &str) -> Option<f64> {
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(subject.to_string(), kind.to_string()))
            .copied()
    }

    pub fn clear(&self) {
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HysteresisTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
