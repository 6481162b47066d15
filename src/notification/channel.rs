//! 通知渠道 trait 定义
//!
//! 核心只通过这些 trait 与外部协作方交互：
//! - [`Mailer`]：投递渲染好的消息
//! - [`ImageFetcher`]：按事件 ID 获取缩略图/快照

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 图片类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Thumbnail,
    Snapshot,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
            Self::Snapshot => "snapshot",
        }
    }

    /// 内联图片的 Content-ID
    pub fn content_id(&self, event_id: &str) -> String {
        format!("{}_{}", self.as_str(), event_id)
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 内联图片
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub kind: ImageKind,
    pub content_id: String,
    pub data: Vec<u8>,
}

/// 消息元数据（用于日志和投递记录）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub rule: String,
    pub subject_id: String,
    pub kind: String,
    pub event_id: String,
}

/// 待发送的消息
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// 收件人（保持规则中的顺序）
    pub targets: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    pub inline_images: Vec<InlineImage>,
    pub metadata: MessageMetadata,
}

impl OutgoingMessage {
    pub fn new(targets: Vec<String>, subject: impl Into<String>) -> Self {
        Self {
            targets,
            subject: subject.into(),
            html_body: String::new(),
            plain_body: String::new(),
            inline_images: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_bodies(mut self, html: impl Into<String>, plain: impl Into<String>) -> Self {
        self.html_body = html.into();
        self.plain_body = plain.into();
        self
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.inline_images.push(image);
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 投递渠道
pub trait Mailer: Send + Sync {
    /// 渠道名称（用于日志）
    fn name(&self) -> &str;

    /// 发送消息，返回 `Ok(true)` 表示确认送达
    fn send(&self, message: &OutgoingMessage) -> Result<bool>;
}

/// 图片获取
pub trait ImageFetcher: Send + Sync {
    /// 获取失败返回 `None`，由调用方省略该图片
    fn fetch(&self, event_id: &str, kind: ImageKind) -> Option<Vec<u8>>;
}

/// 不获取任何图片
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImages;

impl ImageFetcher for NoImages {
    fn fetch(&self, _event_id: &str, _kind: ImageKind) -> Option<Vec<u8>> {
        None
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// UPDATE 阶段，或规则未订阅该阶段
    Phase,
    /// top_score 低于阈值
    Score,
    QuietHours,
    Hysteresis,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Phase => "phase",
            Self::Score => "score",
            Self::QuietHours => "quiet_hours",
            Self::Hysteresis => "hysteresis",
            Self::DryRun => "dry_run",
        };
        f.write_str(s)
    }
}

/// 单条规则的分发结果
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 发送成功，已写入 hysteresis
    Sent,
    /// 被门控跳过
    Skipped(SkipReason),
    /// 发送失败，hysteresis 未修改
    Failed(String),
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}
