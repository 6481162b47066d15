//! JSONL 文件来源 - 按偏移量追读新增行
//!
//! 每行可以是：
//! - `{"source": "message_bus", "payload": {...}}`，显式指定来源
//! - 原始 payload，使用来源的默认类型
//!
//! 无法解析的行原样交给归一化器，由其报告 `MalformedPayload`。

use anyhow::Result;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{EventSource, RawEvent};
use crate::event::SourceKind;

pub struct JsonlFileSource {
    name: String,
    path: PathBuf,
    default_kind: SourceKind,
    position: u64,
    pending: VecDeque<RawEvent>,
}

impl JsonlFileSource {
    pub fn new(path: impl Into<PathBuf>, default_kind: SourceKind) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            default_kind,
            position: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 跳过已有内容，只读之后追加的行
    pub fn start_at_end(mut self) -> Self {
        self.position = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// 解析单行
    pub fn parse_line(line: &str, default_kind: SourceKind) -> Result<Option<RawEvent>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => return Ok(Some(RawEvent::payload(default_kind, line))),
        };

        let envelope = value
            .as_object()
            .filter(|o| o.contains_key("payload") && o.get("source").map_or(false, Value::is_string));
        match envelope {
            Some(object) => {
                let source = object
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .parse::<SourceKind>()?;
                let payload = object.get("payload").cloned().unwrap_or(Value::Null);
                Ok(Some(RawEvent::payload(source, payload.to_string())))
            }
            None => Ok(Some(RawEvent::payload(default_kind, line))),
        }
    }

    /// 读取新增的完整行
    pub fn read_new_events(&mut self) -> Result<Vec<RawEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        // 文件被截断或轮转
        if file_len < self.position {
            warn!(path = %self.path.display(), "Event file shrank, reading from start");
            self.position = 0;
        }
        if file_len == self.position {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.position))?;

        let mut events = Vec::new();
        loop {
            let mut buf = Vec::new();
            let read = match reader.read_until(b'\n', &mut buf) {
                Ok(read) => read,
                Err(e) => {
                    // 已读到的事件照常返回，剩余部分下次再读
                    warn!(source = %self.name, error = %e, "Event file read interrupted");
                    break;
                }
            };
            // 末尾不完整的行等下次再读
            if read == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.position += read as u64;

            let line = match String::from_utf8(buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!(
                        source = %self.name,
                        offset = self.position - read as u64,
                        error = %e,
                        "Skipping non UTF-8 event line"
                    );
                    continue;
                }
            };

            match Self::parse_line(&line, self.default_kind) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(source = %self.name, error = %e, "Skipping event line"),
            }
        }

        debug!(source = %self.name, count = events.len(), position = self.position, "Read event lines");
        Ok(events)
    }
}

impl EventSource for JsonlFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Result<Option<RawEvent>> {
        if self.pending.is_empty() {
            let events = self.read_new_events()?;
            self.pending.extend(events);
        }
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_parse_line_shapes() {
        let envelope = r#"{"source": "hub", "payload": {"device": "Front Door", "value": "open"}}"#;
        match JsonlFileSource::parse_line(envelope, SourceKind::MessageBus).unwrap() {
            Some(RawEvent::Payload { source, payload }) => {
                assert_eq!(source, SourceKind::HubWebhook);
                assert!(payload.contains("Front Door"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = r#"{"type": "new", "after": {"camera": "c", "label": "person"}}"#;
        assert_eq!(
            JsonlFileSource::parse_line(raw, SourceKind::MessageBus).unwrap(),
            Some(RawEvent::payload(SourceKind::MessageBus, raw))
        );

        assert_eq!(JsonlFileSource::parse_line("   ", SourceKind::MessageBus).unwrap(), None);
        assert_eq!(
            JsonlFileSource::parse_line("not json", SourceKind::CameraApi).unwrap(),
            Some(RawEvent::payload(SourceKind::CameraApi, "not json"))
        );
        assert!(JsonlFileSource::parse_line(
            r#"{"source": "pager", "payload": {}}"#,
            SourceKind::MessageBus
        )
        .is_err());
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut bytes = b"{\"n\":1}\n".to_vec();
        bytes.extend_from_slice(b"\xff\xfe\n");
        bytes.extend_from_slice(b"{\"n\":3}\n");
        std::fs::write(&path, &bytes).unwrap();

        let mut source = JsonlFileSource::new(&path, SourceKind::MessageBus);
        let mut payloads = Vec::new();
        for _ in 0..5 {
            if let Some(RawEvent::Payload { payload, .. }) = source.poll().unwrap() {
                payloads.push(payload);
            }
        }
        assert_eq!(payloads, vec![r#"{"n":1}"#, r#"{"n":3}"#]);
        assert_eq!(source.position(), bytes.len() as u64);
    }

    #[test]
    fn test_tail_reads_only_complete_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        append(&path, "{\"a\":1}\n\n{\"b\":2");

        let mut source = JsonlFileSource::new(&path, SourceKind::MessageBus);
        assert!(source.poll().unwrap().is_some());
        assert!(source.poll().unwrap().is_none());

        append(&path, "}\n");
        match source.poll().unwrap() {
            Some(RawEvent::Payload { payload, .. }) => assert_eq!(payload, "{\"b\":2}"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(source.poll().unwrap().is_none());
    }

    #[test]
    fn test_start_at_end_and_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        append(&path, "{\"old\":1}\n");

        let mut source = JsonlFileSource::new(&path, SourceKind::MessageBus).start_at_end();
        assert!(source.poll().unwrap().is_none());

        std::fs::write(&path, "{\"new\":1}\n").unwrap();
        // 长度相同，不视为新内容
        assert!(source.poll().unwrap().is_none());

        std::fs::write(&path, "{}\n").unwrap();
        assert!(source.poll().unwrap().is_some());
    }

    #[test]
    fn test_missing_file_is_quiet() {
        let dir = TempDir::new().unwrap();
        let mut source = JsonlFileSource::new(dir.path().join("none.jsonl"), SourceKind::MessageBus);
        assert!(source.poll().unwrap().is_none());
        assert_eq!(source.name(), dir.path().join("none.jsonl").display().to_string());
    }
}
