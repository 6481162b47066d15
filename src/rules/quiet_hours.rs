//! 免打扰时段判断
//!
//! 支持跨越午夜的窗口（如 22:00 - 07:00），两端均为闭区间。

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NotifyError, Result};

/// 免打扰时段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// 解析 "HH:MM" 格式的起止时间
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    /// 当前时间是否落在窗口内
    pub fn contains(&self, now: NaiveTime) -> bool {
        is_quiet(now, Some(self.start), Some(self.end))
    }

    /// 是否跨越午夜
    pub fn spans_midnight(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for QuietHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// 判断是否处于免打扰时段
///
/// - `start <= end`：`start <= now <= end`
/// - `start > end`（跨午夜）：`now >= start || now <= end`
/// - 任一端缺失：永不免打扰
pub fn is_quiet(now: NaiveTime, start: Option<NaiveTime>, end: Option<NaiveTime>) -> bool {
    match (start, end) {
        (Some(start), Some(end)) if start <= end => start <= now && now <= end,
        (Some(start), Some(end)) => now >= start || now <= end,
        _ => false,
    }
}

/// 解析一天中的时间，接受 `HH:MM` 和 `HH:MM:SS`
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| {
            NotifyError::Config(format!(
                "invalid time of day '{}', expected HH:MM",
                value
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        parse_time_of_day(s).unwrap()
    }

    #[test]
    fn test_window_spanning_midnight() {
        let window = QuietHours::parse("22:00", "07:00").unwrap();
        assert!(window.spans_midnight());
        assert!(window.contains(t("23:30")));
        assert!(window.contains(t("06:59")));
        assert!(window.contains(t("22:00")));
        assert!(window.contains(t("07:00")));
        assert!(!window.contains(t("12:00")));
        assert!(!window.contains(t("07:01")));
    }

    #[test]
    fn test_same_day_window() {
        let window = QuietHours::parse("09:00", "17:30").unwrap();
        assert!(!window.spans_midnight());
        assert!(window.contains(t("09:00")));
        assert!(window.contains(t("12:00")));
        assert!(window.contains(t("17:30")));
        assert!(!window.contains(t("17:31")));
        assert!(!window.contains(t("08:59")));
    }

    #[test]
    fn test_missing_bound_never_quiet() {
        assert!(!is_quiet(t("23:00"), Some(t("22:00")), None));
        assert!(!is_quiet(t("23:00"), None, Some(t("07:00"))));
        assert!(!is_quiet(t("23:00"), None, None));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(t("7:05"), NaiveTime::from_hms_opt(7, 5, 0).unwrap());
        assert_eq!(t("23:59:30"), NaiveTime::from_hms_opt(23, 59, 30).unwrap());
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_display() {
        let window = QuietHours::parse("22:00", "7:00").unwrap();
        assert_eq!(window.to_string(), "22:00-07:00");
    }
}
