//! 事件归一化器 - 将各来源的原始 payload 转换为 NormalizedEvent
//!
//! 每种来源实现 [`PayloadNormalizer`]，在启动时注册到 [`EventNormalizer`]。
//! 缺失的可选字段一律取默认值，只有 payload 不是 JSON 对象时才报错。

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::{clamp_score, EventPhase, NormalizedEvent, SourceKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{NotifyError, Result};

/// 单一来源的归一化器
pub trait PayloadNormalizer: Send + Sync {
    /// 负责的来源类型
    fn source_kind(&self) -> SourceKind;

    /// 将已解析的 JSON 对象转换为事件
    ///
    /// `received_at` 在 payload 不带时间时作为事件时间
    fn normalize(&self, payload: &Map<String, Value>, received_at: f64) -> NormalizedEvent;
}

/// 归一化器注册表
pub struct EventNormalizer {
    normalizers: HashMap<SourceKind, Box<dyn PayloadNormalizer>>,
    clock: Arc<dyn Clock>,
}

impl EventNormalizer {
    /// 创建空注册表
    pub fn empty(clock: Arc<dyn Clock>) -> Self {
        Self {
            normalizers: HashMap::new(),
            clock,
        }
    }

    /// 创建并注册内置的三种归一化器
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self::empty(clock);
        registry.register(Box::new(MessageBusNormalizer));
        registry.register(Box::new(CameraApiNormalizer));
        registry.register(Box::new(HubWebhookNormalizer));
        registry
    }

    /// 注册归一化器，同类来源后注册者覆盖先注册者
    pub fn register(&mut self, normalizer: Box<dyn PayloadNormalizer>) {
        self.normalizers.insert(normalizer.source_kind(), normalizer);
    }

    /// 归一化原始文本 payload
    pub fn normalize(&self, source: SourceKind, raw: &str) -> Result<NormalizedEvent> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| NotifyError::malformed(source.as_str(), e.to_string()))?;
        self.normalize_value(source, &value)
    }

    /// 归一化已解析的 JSON
    pub fn normalize_value(&self, source: SourceKind, value: &Value) -> Result<NormalizedEvent> {
        let object = value.as_object().ok_or_else(|| {
            NotifyError::malformed(source.as_str(), "payload is not a JSON object")
        })?;
        let normalizer = self.normalizers.get(&source).ok_or_else(|| {
            NotifyError::malformed(source.as_str(), "no normalizer registered")
        })?;

        let event = normalizer
            .normalize(object, self.clock.now())
            .with_source(source);
        debug!(
            source = %source,
            subject = %event.subject_id,
            kind = %event.kind,
            phase = %event.phase,
            "Normalized event"
        );
        Ok(event)
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<_> = self.normalizers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

// ============================================================================
// NVR 消息总线
// ============================================================================

/// NVR 总线事件：`{"type": "new|update|end", "before": {...}, "after": {...}}`
pub struct MessageBusNormalizer;

impl PayloadNormalizer for MessageBusNormalizer {
    fn source_kind(&self) -> SourceKind {
        SourceKind::MessageBus
    }

    fn normalize(&self, payload: &Map<String, Value>, received_at: f64) -> NormalizedEvent {
        let phase = str_field(payload, &["type"])
            .map(EventPhase::parse)
            .unwrap_or_default();
        let data = payload
            .get("after")
            .and_then(Value::as_object)
            .unwrap_or(payload);

        let subject = str_field(data, &["camera"]).unwrap_or("unknown");
        let kind = str_field(data, &["label"]).unwrap_or("unknown");
        let timestamp = f64_field(data, &["start_time", "frame_time"]).unwrap_or(received_at);
        let score = f64_field(data, &["score"]).unwrap_or(0.0);
        // top_score 缺失时退化为 score
        let top_score = f64_field(data, &["top_score"]).unwrap_or(score);

        let mut event = NormalizedEvent::new(subject, kind, timestamp)
            .with_phase(phase)
            .with_score(score)
            .with_top_score(top_score)
            .with_zones(string_set(data.get("current_zones")))
            .with_entered_zones(string_set(data.get("entered_zones")));
        if let Some(id) = id_field(data, &["id"]) {
            event.event_id = id;
        }
        event.attributes = attribute_map(data.get("attributes"));
        event.sub_label = sub_label(data.get("sub_label"));
        event
    }
}

// ============================================================================
// 摄像头厂商 API
// ============================================================================

/// 摄像头厂商事件：`{"camera"|"name", "event"|"kind", "score", "id", "time"}`
pub struct CameraApiNormalizer;

impl PayloadNormalizer for CameraApiNormalizer {
    fn source_kind(&self) -> SourceKind {
        SourceKind::CameraApi
    }

    fn normalize(&self, payload: &Map<String, Value>, received_at: f64) -> NormalizedEvent {
        let subject = str_field(payload, &["camera", "name", "channel_name"]).unwrap_or("unknown");
        let kind = str_field(payload, &["event", "kind"]).unwrap_or("unknown");
        let phase = str_field(payload, &["phase"])
            .map(EventPhase::parse)
            .unwrap_or_default();
        let timestamp = f64_field(payload, &["time", "timestamp"]).unwrap_or(received_at);
        let score = f64_field(payload, &["score"]).unwrap_or(0.0);
        let top_score = f64_field(payload, &["top_score"]).unwrap_or(score);

        let mut event = NormalizedEvent::new(subject, kind, timestamp)
            .with_phase(phase)
            .with_score(score)
            .with_top_score(top_score)
            .with_zones(string_set(payload.get("zones")));
        if let Some(id) = id_field(payload, &["id", "event_id"]) {
            event.event_id = id;
        }
        if let Some(ip) = str_field(payload, &["ip", "host"]) {
            event.details.insert("ip".to_string(), ip.to_string());
        }
        event
    }
}

// ============================================================================
// Hub webhook
// ============================================================================

/// Hub 事件：Maker API 的 `{"content": {...}}` 或扁平的 `{"device", "value"}`
///
/// Hub 上报的是离散状态变化，统一视为 NEW 且分数为 1.0
pub struct HubWebhookNormalizer;

impl PayloadNormalizer for HubWebhookNormalizer {
    fn source_kind(&self) -> SourceKind {
        SourceKind::HubWebhook
    }

    fn normalize(&self, payload: &Map<String, Value>, received_at: f64) -> NormalizedEvent {
        let content = payload
            .get("content")
            .and_then(Value::as_object)
            .unwrap_or(payload);

        let device_id = id_field(content, &["deviceId", "device_id"]);
        let subject = str_field(content, &["displayName", "device", "label"])
            .map(str::to_string)
            .or_else(|| device_id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let name = str_field(content, &["name", "attribute"]);
        let value = scalar_text(content.get("value"));
        let kind = hub_kind(name, value.as_deref());

        let phase = str_field(content, &["phase"])
            .map(EventPhase::parse)
            .unwrap_or(EventPhase::New);

        let mut event = NormalizedEvent::new(subject, kind, received_at)
            .with_phase(phase)
            .with_score(1.0);
        if let Some(value) = value {
            event.details.insert("value".to_string(), value);
        }
        if let Some(device_id) = device_id {
            event.details.insert("device_id".to_string(), device_id);
        }
        event
    }
}

/// Hub 事件类型映射
///
/// presence 映射为 arrived/departed，其余为 `{name}_{value}`（小写，空格转下划线）
pub fn hub_kind(name: Option<&str>, value: Option<&str>) -> String {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    let value = value.map(str::trim).filter(|v| !v.is_empty());

    let raw = match (name, value) {
        (Some(n), Some(v)) if n.eq_ignore_ascii_case("presence") => {
            match v.to_ascii_lowercase().as_str() {
                "present" => return "arrived".to_string(),
                "not present" => return "departed".to_string(),
                _ => format!("{}_{}", n, v),
            }
        }
        (Some(n), Some(v)) => format!("{}_{}", n, v),
        (Some(n), None) => n.to_string(),
        (None, Some(v)) => v.to_string(),
        (None, None) => "unknown".to_string(),
    };
    raw.to_lowercase().replace(' ', "_")
}

// ============================================================================
// 字段读取辅助函数
// ============================================================================

fn str_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find_map(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn f64_field(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| object.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// ID 可能是字符串或数字
fn id_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find_map(|v| scalar_text(Some(v)))
}

fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

/// 属性可以是 `{"name": score}`、`[{"label", "score"}]` 或 `["name"]`
fn attribute_map(value: Option<&Value>) -> BTreeMap<String, f64> {
    let mut attributes = BTreeMap::new();
    match value {
        Some(Value::Object(map)) => {
            for (name, score) in map {
                let score = score.as_f64().unwrap_or(0.0);
                attributes.insert(name.clone(), clamp_score(score));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(name) => {
                        attributes.insert(name.clone(), 1.0);
                    }
                    Value::Object(entry) => {
                        if let Some(label) = str_field(entry, &["label", "name"]) {
                            let score = f64_field(entry, &["score"]).unwrap_or(0.0);
                            attributes.insert(label.to_string(), clamp_score(score));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    attributes
}

/// sub_label 为 `[name, score]` 或单独的字符串
fn sub_label(value: Option<&Value>) -> Option<(String, f64)> {
    match value? {
        Value::Array(items) => {
            let name = items.first()?.as_str()?.to_string();
            let score = items.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            Some((name, clamp_score(score)))
        }
        Value::String(s) if !s.is_empty() => Some((s.clone(), 0.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(Arc::new(ManualClock::new(1_000.0)))
    }

    #[test]
    fn test_bus_payload_reads_after() {
        let payload = json!({
            "type": "new",
            "before": {"camera": "old", "label": "cat"},
            "after": {
                "id": "1700000000.123-abc",
                "camera": "front_door",
                "label": "person",
                "score": 0.71,
                "top_score": 0.82,
                "current_zones": ["porch"],
                "entered_zones": ["porch", "driveway"],
                "attributes": {"face": 0.6},
                "sub_label": ["alice", 0.93],
                "start_time": 1700000000.1
            }
        });
        let event = normalizer()
            .normalize_value(SourceKind::MessageBus, &payload)
            .unwrap();

        assert_eq!(event.subject_id, "front_door");
        assert_eq!(event.kind, "person");
        assert_eq!(event.phase, EventPhase::New);
        assert_eq!(event.score, 0.71);
        assert_eq!(event.top_score, 0.82);
        assert!(event.zones_current.contains("porch"));
        assert_eq!(event.zones_entered.len(), 2);
        assert_eq!(event.attributes["face"], 0.6);
        assert_eq!(event.sub_label, Some(("alice".to_string(), 0.93)));
        assert_eq!(event.event_id, "1700000000.123-abc");
        assert_eq!(event.timestamp, 1700000000.1);
        assert_eq!(event.source, SourceKind::MessageBus);
    }

    #[test]
    fn test_bus_payload_missing_fields_default() {
        let event = normalizer()
            .normalize(SourceKind::MessageBus, r#"{"type": "bogus"}"#)
            .unwrap();
        assert_eq!(event.phase, EventPhase::Update);
        assert_eq!(event.subject_id, "unknown");
        assert_eq!(event.kind, "unknown");
        assert_eq!(event.score, 0.0);
        assert_eq!(event.top_score, 0.0);
        assert!(event.zones_current.is_empty());
        assert_eq!(event.timestamp, 1_000.0);
        assert_eq!(event.event_id, "unknown-unknown-1000000");
    }

    #[test]
    fn test_bus_payload_top_level_fallback() {
        let event = normalizer()
            .normalize(
                SourceKind::MessageBus,
                r#"{"type": "end", "camera": "garage", "label": "car", "score": 0.9}"#,
            )
            .unwrap();
        assert_eq!(event.subject_id, "garage");
        assert_eq!(event.phase, EventPhase::End);
        assert_eq!(event.top_score, 0.9);
    }

    #[test]
    fn test_scores_clamped() {
        let event = normalizer()
            .normalize(
                SourceKind::MessageBus,
                r#"{"after": {"score": 3.5, "top_score": -1}}"#,
            )
            .unwrap();
        assert_eq!(event.score, 1.0);
        assert_eq!(event.top_score, 0.0);
    }

    #[test]
    fn test_malformed_payloads() {
        let n = normalizer();
        assert!(matches!(
            n.normalize(SourceKind::MessageBus, "{not json"),
            Err(NotifyError::MalformedPayload { .. })
        ));
        assert!(matches!(
            n.normalize(SourceKind::CameraApi, "42"),
            Err(NotifyError::MalformedPayload { .. })
        ));
        assert!(matches!(
            n.normalize(SourceKind::HubWebhook, "[1, 2]"),
            Err(NotifyError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_camera_api_payload() {
        let event = normalizer()
            .normalize(
                SourceKind::CameraApi,
                r#"{"name": "doorbell", "event": "doorbell_press", "phase": "new", "score": 1.0, "time": 1700000001}"#,
            )
            .unwrap();
        assert_eq!(event.subject_id, "doorbell");
        assert_eq!(event.kind, "doorbell_press");
        assert_eq!(event.phase, EventPhase::New);
        assert_eq!(event.top_score, 1.0);
        assert_eq!(event.event_id, "doorbell-doorbell_press-1700000001000");
    }

    #[test]
    fn test_camera_api_defaults_to_update() {
        let event = normalizer()
            .normalize(SourceKind::CameraApi, r#"{"camera": "side"}"#)
            .unwrap();
        assert_eq!(event.phase, EventPhase::Update);
        assert_eq!(event.kind, "unknown");
    }

    #[test]
    fn test_hub_maker_api_presence() {
        let payload = json!({
            "content": {
                "name": "presence",
                "value": "not present",
                "displayName": "Alice Phone",
                "deviceId": 42
            }
        });
        let event = normalizer()
            .normalize_value(SourceKind::HubWebhook, &payload)
            .unwrap();
        assert_eq!(event.subject_id, "Alice Phone");
        assert_eq!(event.kind, "departed");
        assert_eq!(event.phase, EventPhase::New);
        assert_eq!(event.score, 1.0);
        assert_eq!(event.details["device_id"], "42");
    }

    #[test]
    fn test_hub_flat_shape() {
        let event = normalizer()
            .normalize(
                SourceKind::HubWebhook,
                r#"{"device": "Garage Door", "value": "Open"}"#,
            )
            .unwrap();
        assert_eq!(event.subject_id, "Garage Door");
        assert_eq!(event.kind, "open");
        assert_eq!(event.phase, EventPhase::New);
    }

    #[test]
    fn test_hub_kind_mapping() {
        assert_eq!(hub_kind(Some("presence"), Some("present")), "arrived");
        assert_eq!(hub_kind(Some("contact"), Some("open")), "contact_open");
        assert_eq!(hub_kind(Some("Motion Sensor"), Some("Active")), "motion_sensor_active");
        assert_eq!(hub_kind(Some("switch"), None), "switch");
        assert_eq!(hub_kind(None, None), "unknown");
    }

    #[test]
    fn test_attribute_shapes() {
        let list = attribute_map(Some(&json!([{"label": "amazon", "score": 0.8}, "ups"])));
        assert_eq!(list["amazon"], 0.8);
        assert_eq!(list["ups"], 1.0);
        assert!(attribute_map(Some(&json!(null))).is_empty());
    }

    #[test]
    fn test_sources_registered() {
        assert_eq!(
            normalizer().sources(),
            vec![
                SourceKind::CameraApi,
                SourceKind::HubWebhook,
                SourceKind::MessageBus
            ]
        );
    }
}
