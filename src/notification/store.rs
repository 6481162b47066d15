//! 投递记录 - 本地 JSONL 文件读写
//!
//! 只追加，不被引擎读回；超过上限后保留最近的记录。

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::channel::OutgoingMessage;

/// 投递记录（JSONL 格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// ISO8601 时间戳
    pub ts: DateTime<Utc>,
    pub rule: String,
    pub subject_id: String,
    pub kind: String,
    pub event_id: String,
    pub targets: Vec<String>,
    /// 邮件主题
    pub title: String,
    /// 纯文本正文
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// 内联图片的 Content-ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl DeliveryRecord {
    pub fn from_message(message: &OutgoingMessage) -> Self {
        Self {
            ts: Utc::now(),
            rule: message.metadata.rule.clone(),
            subject_id: message.metadata.subject_id.clone(),
            kind: message.metadata.kind.clone(),
            event_id: message.metadata.event_id.clone(),
            targets: message.targets.clone(),
            title: message.subject.clone(),
            body: message.plain_body.clone(),
            images: message
                .inline_images
                .iter()
                .map(|i| i.content_id.clone())
                .collect(),
        }
    }
}

/// 投递记录存储
pub struct DeliveryStore {
    path: PathBuf,
    max_records: usize,
    keep_after_cleanup: usize,
    write_count: AtomicUsize,
}

const MAX_RECORDS: usize = 500;
const KEEP_AFTER_CLEANUP: usize = 250;
const CLEANUP_CHECK_INTERVAL: usize = 10;

impl DeliveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_records: MAX_RECORDS,
            keep_after_cleanup: KEEP_AFTER_CLEANUP,
            write_count: AtomicUsize::new(0),
        }
    }

    /// 设置上限（清理后保留一半）
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self.keep_after_cleanup = (self.max_records / 2).max(1);
        self
    }

    /// 默认存储路径：`<config_dir>/event-notifier/deliveries.jsonl`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("event-notifier")
            .join("deliveries.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加记录（带文件锁）
    pub fn append(&self, record: &DeliveryRecord) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;
        let mut file = file;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.unlock()?;

        self.maybe_cleanup();
        Ok(())
    }

    /// 读取最近 N 条记录
    pub fn read_recent(&self, n: usize) -> Vec<DeliveryRecord> {
        let records = match self.read_all() {
            Ok(records) => records,
            Err(_) => return Vec::new(),
        };
        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }

    fn read_all(&self) -> Result<Vec<DeliveryRecord>> {
        let file = File::open(&self.path)?;
        Ok(BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    /// 定期检查并清理
    fn maybe_cleanup(&self) {
        let count = self.write_count.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_CHECK_INTERVAL != 0 {
            return;
        }
        if let Err(e) = self.cleanup() {
            tracing::debug!(error = %e, path = %self.path.display(), "Delivery log cleanup skipped");
        }
    }

    /// 执行清理（保留最近的记录）
    pub fn cleanup(&self) -> Result<()> {
        use fs2::FileExt;

        let file = File::open(&self.path)?;
        file.lock_exclusive()?;

        let records: Vec<DeliveryRecord> = BufReader::new(&file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        if records.len() <= self.max_records {
            file.unlock()?;
            return Ok(());
        }

        let start = records.len().saturating_sub(self.keep_after_cleanup);
        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = File::create(&temp_path)?;
            for record in &records[start..] {
                writeln!(temp_file, "{}", serde_json::to_string(record)?)?;
            }
        }

        // 原子替换
        fs::rename(&temp_path, &self.path)?;
        file.unlock()?;
        Ok(())
    }
}
