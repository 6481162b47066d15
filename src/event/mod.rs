//! 统一事件结构
//!
//! 摄像头厂商 API、NVR 消息总线、智能家居 Hub 的事件都先归一化为
//! [`NormalizedEvent`]，再交给规则匹配和通知分发。

pub mod normalizer;

pub use normalizer::{EventNormalizer, PayloadNormalizer};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::NotifyError;

/// 事件阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    New,
    #[default]
    Update,
    End,
}

impl EventPhase {
    /// 解析阶段字符串，未知值视为 Update
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" | "start" => Self::New,
            "end" | "stop" => Self::End,
            _ => Self::Update,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Update => "update",
            Self::End => "end",
        }
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// 摄像头厂商 API（门铃等）
    CameraApi,
    /// NVR 消息总线 JSON
    #[default]
    MessageBus,
    /// Hub webhook（Maker API 等）
    HubWebhook,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CameraApi => "camera_api",
            Self::MessageBus => "message_bus",
            Self::HubWebhook => "hub_webhook",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "camera_api" | "camera" | "doorbell" => Ok(Self::CameraApi),
            "message_bus" | "bus" | "mqtt" | "nvr" => Ok(Self::MessageBus),
            "hub_webhook" | "hub" | "webhook" => Ok(Self::HubWebhook),
            other => Err(NotifyError::Config(format!(
                "unknown source kind '{}'",
                other
            ))),
        }
    }
}

/// 归一化后的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// 摄像头或设备名
    pub subject_id: String,
    /// 对象标签或事件类型（person, doorbell_press, arrived ...）
    pub kind: String,
    pub phase: EventPhase,
    /// 当前分数 [0,1]
    pub score: f64,
    /// 事件生命周期内最高分数 [0,1]
    pub top_score: f64,
    /// 当前所在区域
    #[serde(default)]
    pub zones_current: BTreeSet<String>,
    /// 曾经进入的区域
    #[serde(default)]
    pub zones_entered: BTreeSet<String>,
    /// 属性及其置信度
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
    /// 稳定事件 ID（缺失时合成）
    pub event_id: String,
    /// 事件时间（epoch 秒）
    pub timestamp: f64,
    /// 二级识别结果（如人脸），附带分数
    #[serde(default)]
    pub sub_label: Option<(String, f64)>,
    /// 附加的文本详情（IP、厂商等），仅用于渲染
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    #[serde(default)]
    pub source: SourceKind,
}

impl NormalizedEvent {
    /// 创建事件，其余字段取默认值，event_id 按 `<subject>-<kind>-<millis>` 合成
    pub fn new(subject_id: impl Into<String>, kind: impl Into<String>, timestamp: f64) -> Self {
        let subject_id = subject_id.into();
        let kind = kind.into();
        let event_id = synthesize_event_id(&subject_id, &kind, timestamp);
        Self {
            subject_id,
            kind,
            phase: EventPhase::Update,
            score: 0.0,
            top_score: 0.0,
            zones_current: BTreeSet::new(),
            zones_entered: BTreeSet::new(),
            attributes: BTreeMap::new(),
            event_id,
            timestamp,
            sub_label: None,
            details: BTreeMap::new(),
            source: SourceKind::default(),
        }
    }

    pub fn with_phase(mut self, phase: EventPhase) -> Self {
        self.phase = phase;
        self
    }

    /// 同时设置 score 和 top_score
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = clamp_score(score);
        self.top_score = self.score;
        self
    }

    pub fn with_top_score(mut self, top_score: f64) -> Self {
        self.top_score = clamp_score(top_score);
        self
    }

    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones_current = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_entered_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones_entered = zones.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, score: f64) -> Self {
        self.attributes.insert(name.into(), clamp_score(score));
        self
    }

    pub fn with_sub_label(mut self, label: impl Into<String>, score: f64) -> Self {
        self.sub_label = Some((label.into(), clamp_score(score)));
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }

    /// hysteresis 使用的键
    pub fn key(&self) -> (&str, &str) {
        (&self.subject_id, &self.kind)
    }
}

/// 将分数限制在 [0,1]，NaN 视为 0
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// 合成事件 ID：`<subject>-<kind>-<millis>`
pub fn synthesize_event_id(subject_id: &str, kind: &str, timestamp: f64) -> String {
    format!("{}-{}-{}", subject_id, kind, (timestamp * 1000.0).round() as i64)
}
