//! 通知层：门控、渲染、投递
//!
//! 流程：`NotificationDispatcher::process` 对每条匹配规则依次检查
//! phase → 分数 → 静默时段 → hysteresis，通过后获取图片、渲染邮件并交给 `Mailer`。
//! 只有投递确认成功才写入 hysteresis。

pub mod builder;
pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod formatter;
pub mod hysteresis;
pub mod store;

pub use builder::DispatcherBuilder;
pub use channel::{
    DispatchOutcome, ImageFetcher, ImageKind, InlineImage, Mailer, MessageMetadata, NoImages,
    OutgoingMessage, SkipReason,
};
pub use channels::{LocalFileMailer, SendmailMailer};
pub use dispatcher::NotificationDispatcher;
pub use formatter::MessageFormatter;
pub use hysteresis::HysteresisTracker;
pub use store::{DeliveryRecord, DeliveryStore};
