//! 通知分发器 - 对匹配的规则依次执行门控、补充图片、渲染并发送
//!
//! 门控顺序（任一不满足即跳过该规则）：
//! 1. 阶段：NEW 需要 notify_on_new，END 需要 notify_on_end，UPDATE 一律跳过
//! 2. 分数：top_score >= min_score
//! 3. 免打扰时段
//! 4. hysteresis（按 subject + kind）
//!
//! 只有 Mailer 确认发送成功才写入 hysteresis。

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::channel::{
    DispatchOutcome, ImageFetcher, ImageKind, InlineImage, Mailer, NoImages, SkipReason,
};
use super::formatter::MessageFormatter;
use super::hysteresis::HysteresisTracker;
use crate::clock::Clock;
use crate::error::NotifyError;
use crate::event::{EventPhase, NormalizedEvent};
use crate::rules::NotificationRule;

/// 通知分发器
pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    images: Arc<dyn ImageFetcher>,
    formatter: MessageFormatter,
    hysteresis: Arc<HysteresisTracker>,
    clock: Arc<dyn Clock>,
    /// 是否为 dry-run 模式
    dry_run: bool,
}

impl NotificationDispatcher {
    /// 创建新的分发器
    pub fn new(mailer: Arc<dyn Mailer>, clock: Arc<dyn Clock>) -> Self {
        info!(mailer = mailer.name(), "Registering mailer");
        Self {
            mailer,
            images: Arc::new(NoImages),
            formatter: MessageFormatter::new(),
            hysteresis: Arc::new(HysteresisTracker::new(clock.clone())),
            clock,
            dry_run: false,
        }
    }

    /// 设置图片获取器
    pub fn with_image_fetcher(mut self, images: Arc<dyn ImageFetcher>) -> Self {
        self.images = images;
        self
    }

    pub fn with_formatter(mut self, formatter: MessageFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// 共享外部的 hysteresis 状态
    pub fn with_hysteresis(mut self, hysteresis: Arc<HysteresisTracker>) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    /// 设置 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn hysteresis(&self) -> &HysteresisTracker {
        &self.hysteresis
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn mailer_name(&self) -> &str {
        self.mailer.name()
    }

    /// 对每条匹配规则执行门控和发送，返回 (规则名, 结果)
    pub fn process(
        &self,
        event: &NormalizedEvent,
        rules: &[&NotificationRule],
    ) -> Vec<(String, DispatchOutcome)> {
        rules
            .iter()
            .map(|rule| (rule.name.clone(), self.process_rule(event, rule)))
            .collect()
    }

    /// 检查门控，返回第一个不满足的原因
    pub fn gate(&self, event: &NormalizedEvent, rule: &NotificationRule) -> Option<SkipReason> {
        let phase_ok = match event.phase {
            EventPhase::New => rule.notify_on_new,
            EventPhase::End => rule.notify_on_end,
            EventPhase::Update => false,
        };
        if !phase_ok {
            return Some(SkipReason::Phase);
        }

        if event.top_score < rule.min_score {
            return Some(SkipReason::Score);
        }

        if let Some(window) = &rule.quiet_hours {
            if window.contains(self.clock.time_of_day()) {
                return Some(SkipReason::QuietHours);
            }
        }

        if !self
            .hysteresis
            .can_notify(&event.subject_id, &event.kind, rule.min_hysteresis_seconds)
        {
            return Some(SkipReason::Hysteresis);
        }

        None
    }

    fn process_rule(&self, event: &NormalizedEvent, rule: &NotificationRule) -> DispatchOutcome {
        if let Some(reason) = self.gate(event, rule) {
            debug!(
                rule = %rule.name,
                subject = %event.subject_id,
                kind = %event.kind,
                phase = %event.phase,
                top_score = event.top_score,
                reason = %reason,
                "Skipping notification"
            );
            return DispatchOutcome::Skipped(reason);
        }

        if self.dry_run {
            let message = self.formatter.render(rule, event, Vec::new());
            info!(
                rule = %rule.name,
                subject = %event.subject_id,
                kind = %event.kind,
                targets = ?message.targets,
                title = %message.subject,
                "[DRY-RUN] Would send notification"
            );
            return DispatchOutcome::Skipped(SkipReason::DryRun);
        }

        let images = self.enrich(event, rule);
        let message = self.formatter.render(rule, event, images);

        match self.mailer.send(&message) {
            Ok(true) => {
                self.hysteresis.record(&event.subject_id, &event.kind);
                info!(
                    rule = %rule.name,
                    subject = %event.subject_id,
                    kind = %event.kind,
                    mailer = self.mailer.name(),
                    targets = message.targets.len(),
                    images = message.inline_images.len(),
                    "Notification sent"
                );
                DispatchOutcome::Sent
            }
            Ok(false) => {
                let err = NotifyError::Delivery(format!(
                    "{} did not confirm delivery",
                    self.mailer.name()
                ));
                warn!(
                    rule = %rule.name,
                    subject = %event.subject_id,
                    kind = %event.kind,
                    error = %err,
                    "Notification not delivered"
                );
                DispatchOutcome::Failed(err.to_string())
            }
            Err(e) => {
                let err = NotifyError::Delivery(format!("{}: {:#}", self.mailer.name(), e));
                warn!(
                    rule = %rule.name,
                    subject = %event.subject_id,
                    kind = %event.kind,
                    error = %err,
                    "Notification send failed"
                );
                DispatchOutcome::Failed(err.to_string())
            }
        }
    }

    /// 按规则获取缩略图和快照，获取失败则省略
    fn enrich(&self, event: &NormalizedEvent, rule: &NotificationRule) -> Vec<InlineImage> {
        let mut wanted = Vec::new();
        if rule.include_thumbnail {
            wanted.push(ImageKind::Thumbnail);
        }
        if rule.include_snapshot {
            wanted.push(ImageKind::Snapshot);
        }

        wanted
            .into_iter()
            .filter_map(|kind| match self.images.fetch(&event.event_id, kind) {
                Some(data) => Some(InlineImage {
                    kind,
                    content_id: kind.content_id(&event.event_id),
                    data,
                }),
                None => {
                    warn!(
                        rule = %rule.name,
                        subject = %event.subject_id,
                        event_id = %event.event_id,
                        image = %kind,
                        "Image unavailable, sending without it"
                    );
                    None
                }
            })
            .collect()
    }
}
