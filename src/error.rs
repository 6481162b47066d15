//! 错误类型定义
//!
//! 核心引擎只区分四类错误：
//! - `MalformedPayload`：原始事件无法解析，丢弃并记录日志
//! - `Delivery`：图片获取或发送失败，不写入 hysteresis
//! - `Config`：规则或配置无效，启动前直接失败
//! - `Auth`：由外部协作方产生，核心不检查凭据

use thiserror::Error;

/// Result 类型别名
pub type Result<T> = std::result::Result<T, NotifyError>;

/// 引擎错误
#[derive(Debug, Error)]
pub enum NotifyError {
    /// 原始事件不是合法的结构化数据
    #[error("Malformed {source_kind} payload: {reason}")]
    MalformedPayload { source_kind: String, reason: String },

    /// 投递失败（图片获取、发送、设备控制）
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// 配置错误（正则无效、缺少必填字段等）
    #[error("Config error: {0}")]
    Config(String),

    /// 认证失败（仅由协作方返回）
    #[error("Auth error: {0}")]
    Auth(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML 解析错误
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl NotifyError {
    /// 构造 MalformedPayload 错误
    pub fn malformed(source_kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            source_kind: source_kind.into(),
            reason: reason.into(),
        }
    }

    /// 是否为启动期致命错误
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Yaml(_))
    }
}
