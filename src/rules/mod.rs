//! 通知规则 - 声明式规则定义、编译与匹配
//!
//! 规则从配置加载时编译一次：
//! - 摄像头/对象类型模式为全匹配、大小写不敏感的正则
//! - `defaults` 按字段合并到每条规则
//! - 任何无效字段在启动时报 `Config` 错误

pub mod quiet_hours;

pub use quiet_hours::{is_quiet, parse_time_of_day, QuietHours};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::error::{NotifyError, Result};
use crate::event::NormalizedEvent;

pub const DEFAULT_SUBJECT_TEMPLATE: &str = "[{camera}] {label} detected";
pub const DEFAULT_HYSTERESIS_SECONDS: f64 = 60.0;
pub const DEFAULT_MIN_SCORE: f64 = 0.5;

/// 配置文件中的规则定义，所有字段可选，缺失时从 defaults 合并
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefinition {
    pub name: Option<String>,
    #[serde(alias = "camera", alias = "subject")]
    pub subject_pattern: Option<String>,
    #[serde(alias = "object_type", alias = "kind")]
    pub kind_pattern: Option<String>,
    #[serde(alias = "email_to", deserialize_with = "string_or_list")]
    pub targets: Option<Vec<String>>,
    #[serde(alias = "hysteresis_seconds")]
    pub min_hysteresis_seconds: Option<f64>,
    pub min_score: Option<f64>,
    pub zones: Option<Vec<String>>,
    pub notify_on_new: Option<bool>,
    pub notify_on_end: Option<bool>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub enabled: Option<bool>,
    pub include_thumbnail: Option<bool>,
    pub include_snapshot: Option<bool>,
    pub include_urls: Option<bool>,
    pub subject_template: Option<String>,
}

impl RuleDefinition {
    /// 按字段合并默认值（规则自身的值优先）
    pub fn merged_with(&self, defaults: &RuleDefinition) -> RuleDefinition {
        fn pick<T: Clone>(own: &Option<T>, fallback: &Option<T>) -> Option<T> {
            own.clone().or_else(|| fallback.clone())
        }

        RuleDefinition {
            name: self.name.clone(),
            subject_pattern: pick(&self.subject_pattern, &defaults.subject_pattern),
            kind_pattern: pick(&self.kind_pattern, &defaults.kind_pattern),
            targets: pick(&self.targets, &defaults.targets),
            min_hysteresis_seconds: pick(
                &self.min_hysteresis_seconds,
                &defaults.min_hysteresis_seconds,
            ),
            min_score: pick(&self.min_score, &defaults.min_score),
            zones: pick(&self.zones, &defaults.zones),
            notify_on_new: pick(&self.notify_on_new, &defaults.notify_on_new),
            notify_on_end: pick(&self.notify_on_end, &defaults.notify_on_end),
            quiet_hours_start: pick(&self.quiet_hours_start, &defaults.quiet_hours_start),
            quiet_hours_end: pick(&self.quiet_hours_end, &defaults.quiet_hours_end),
            enabled: pick(&self.enabled, &defaults.enabled),
            include_thumbnail: pick(&self.include_thumbnail, &defaults.include_thumbnail),
            include_snapshot: pick(&self.include_snapshot, &defaults.include_snapshot),
            include_urls: pick(&self.include_urls, &defaults.include_urls),
            subject_template: pick(&self.subject_template, &defaults.subject_template),
        }
    }
}

/// targets 既可以是单个字符串也可以是列表
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => Some(vec![s]),
        Some(OneOrMany::Many(v)) => Some(v),
        None => None,
    })
}

/// 编译后的通知规则
#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub name: String,
    pub subject_pattern: String,
    pub kind_pattern: String,
    subject_regex: Regex,
    kind_regex: Regex,
    pub targets: Vec<String>,
    pub min_hysteresis_seconds: f64,
    pub min_score: f64,
    /// 为空表示不限制区域
    pub zones: BTreeSet<String>,
    pub notify_on_new: bool,
    pub notify_on_end: bool,
    pub quiet_hours: Option<QuietHours>,
    pub enabled: bool,
    pub include_thumbnail: bool,
    pub include_snapshot: bool,
    pub include_urls: bool,
    pub subject_template: String,
}

impl NotificationRule {
    /// 编译规则定义，`index` 用于生成默认名称
    pub fn compile(def: &RuleDefinition, index: usize) -> Result<Self> {
        let name = def
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("rule-{}", index));

        let subject_pattern = def.subject_pattern.clone().unwrap_or_else(|| ".*".into());
        let kind_pattern = def.kind_pattern.clone().unwrap_or_else(|| ".*".into());
        let subject_regex = compile_anchored(&name, "subject", &subject_pattern)?;
        let kind_regex = compile_anchored(&name, "kind", &kind_pattern)?;

        let min_score = def.min_score.unwrap_or(DEFAULT_MIN_SCORE);
        if !(0.0..=1.0).contains(&min_score) {
            return Err(NotifyError::Config(format!(
                "rule '{}': min_score {} is outside [0, 1]",
                name, min_score
            )));
        }

        let min_hysteresis_seconds = def
            .min_hysteresis_seconds
            .unwrap_or(DEFAULT_HYSTERESIS_SECONDS);
        if !min_hysteresis_seconds.is_finite() || min_hysteresis_seconds < 0.0 {
            return Err(NotifyError::Config(format!(
                "rule '{}': hysteresis {} must be a non-negative number of seconds",
                name, min_hysteresis_seconds
            )));
        }

        let enabled = def.enabled.unwrap_or(true);
        let targets: Vec<String> = def
            .targets
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if enabled && targets.is_empty() {
            return Err(NotifyError::Config(format!(
                "rule '{}': enabled rule has no targets",
                name
            )));
        }

        let quiet_hours = match (&def.quiet_hours_start, &def.quiet_hours_end) {
            (Some(start), Some(end)) => Some(QuietHours::parse(start, end).map_err(|e| {
                NotifyError::Config(format!("rule '{}': {}", name, e))
            })?),
            (None, None) => None,
            (start, end) => {
                warn!(
                    rule = %name,
                    start = ?start,
                    end = ?end,
                    "Quiet hours need both start and end, ignoring"
                );
                None
            }
        };

        Ok(Self {
            name,
            subject_pattern,
            kind_pattern,
            subject_regex,
            kind_regex,
            targets,
            min_hysteresis_seconds,
            min_score,
            zones: def.zones.clone().unwrap_or_default().into_iter().collect(),
            notify_on_new: def.notify_on_new.unwrap_or(true),
            notify_on_end: def.notify_on_end.unwrap_or(false),
            quiet_hours,
            enabled,
            include_thumbnail: def.include_thumbnail.unwrap_or(true),
            include_snapshot: def.include_snapshot.unwrap_or(false),
            include_urls: def.include_urls.unwrap_or(true),
            subject_template: def
                .subject_template
                .clone()
                .unwrap_or_else(|| DEFAULT_SUBJECT_TEMPLATE.to_string()),
        })
    }

    /// 判断规则是否匹配事件（不含 phase/score/quiet/hysteresis 门控）
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.subject_regex.is_match(&event.subject_id) {
            return false;
        }
        if !self.kind_regex.is_match(&event.kind) {
            return false;
        }
        if !self.zones.is_empty() && self.zones.is_disjoint(&event.zones_current) {
            return false;
        }
        true
    }
}

/// 编译为全匹配、大小写不敏感的正则
///
/// 用非捕获组包裹，保证 `a|b` 这类交替模式也是整体锚定
fn compile_anchored(rule: &str, field: &str, pattern: &str) -> Result<Regex> {
    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            NotifyError::Config(format!(
                "rule '{}': invalid {} pattern '{}': {}",
                rule, field, pattern, e
            ))
        })
}

/// 编译后的规则集合，保持声明顺序
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<NotificationRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<NotificationRule>) -> Self {
        Self { rules }
    }

    /// 合并 defaults 并编译全部规则，任一规则无效则整体失败
    pub fn load(defaults: &RuleDefinition, definitions: &[RuleDefinition]) -> Result<Self> {
        let rules = definitions
            .iter()
            .enumerate()
            .map(|(i, def)| NotificationRule::compile(&def.merged_with(defaults), i))
            .collect::<Result<Vec<_>>>()?;
        debug!(count = rules.len(), "Loaded notification rules");
        Ok(Self { rules })
    }

    /// 返回所有匹配的规则（声明顺序）
    pub fn matching(&self, event: &NormalizedEvent) -> Vec<&NotificationRule> {
        match_rules(event, &self.rules)
    }

    pub fn rules(&self) -> &[NotificationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 按声明顺序返回所有匹配事件的启用规则
pub fn match_rules<'a>(
    event: &NormalizedEvent,
    rules: &'a [NotificationRule],
) -> Vec<&'a NotificationRule> {
    rules.iter().filter(|rule| rule.matches(event)).collect()
}
