//! 引擎：归一化 → 规则匹配 → 分发
//!
//! 显式持有所有组件，没有全局状态。推送式来源直接调用 [`Engine::handle_raw`]，
//! 拉取式来源交给 [`Engine::run_source`] 轮询，直到 [`Engine::shutdown`]。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::Result;
use crate::event::{EventNormalizer, NormalizedEvent, SourceKind};
use crate::notification::{DispatchOutcome, DispatcherBuilder, NotificationDispatcher};
use crate::rules::{NotificationRule, RuleSet};
use crate::source::{EventSource, RawEvent};

/// 关闭检查的最长间隔
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub type Outcomes = Vec<(String, DispatchOutcome)>;

pub struct Engine {
    normalizer: EventNormalizer,
    rules: RuleSet,
    dispatcher: NotificationDispatcher,
    running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(normalizer: EventNormalizer, rules: RuleSet, dispatcher: NotificationDispatcher) -> Self {
        Self {
            normalizer,
            rules,
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 按配置组装引擎（会创建 HTTP 客户端，不要在异步线程上调用）
    pub fn from_config(config: &AppConfig, clock: Arc<dyn Clock>, dry_run: bool) -> anyhow::Result<Self> {
        let rules = config.rule_set()?;
        let dispatcher = DispatcherBuilder::new(config)
            .clock(clock.clone())
            .dry_run(dry_run)
            .build()?;
        info!(rules = rules.len(), dry_run, "Engine configured");
        Ok(Self::new(EventNormalizer::new(clock), rules, dispatcher))
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    /// 处理一条原始 payload；无法解析时记录并返回 `MalformedPayload`
    pub fn handle_raw(&self, source: SourceKind, raw: &str) -> Result<Outcomes> {
        match self.normalizer.normalize(source, raw) {
            Ok(event) => Ok(self.handle_event(&event)),
            Err(e) => {
                warn!(source = %source, error = %e, "Dropping malformed payload");
                Err(e)
            }
        }
    }

    pub fn handle(&self, raw: RawEvent) -> Result<Outcomes> {
        match raw {
            RawEvent::Payload { source, payload } => self.handle_raw(source, &payload),
            RawEvent::Normalized(event) => Ok(self.handle_event(&event)),
        }
    }

    pub fn handle_event(&self, event: &NormalizedEvent) -> Outcomes {
        let matched = self.matching_rules(event);
        if matched.is_empty() {
            debug!(
                subject = %event.subject_id,
                kind = %event.kind,
                "No rules matched"
            );
            return Vec::new();
        }
        self.dispatcher.process(event, &matched)
    }

    pub fn matching_rules(&self, event: &NormalizedEvent) -> Vec<&NotificationRule> {
        self.rules.matching(event)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Engine started");
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Engine shutting down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 供信号处理等外部代码使用的停止标志
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// 轮询来源直到引擎停止，返回处理的事件数
    ///
    /// 单个事件或单次轮询的错误只记录，不中断循环。
    pub fn run_source(&self, source: &mut dyn EventSource, interval: Duration) -> usize {
        let name = source.name().to_string();
        info!(source = %name, interval_ms = interval.as_millis() as u64, "Polling source");

        let mut handled = 0;
        while self.is_running() {
            match source.poll() {
                Ok(Some(raw)) => {
                    handled += 1;
                    if let Err(e) = self.handle(raw) {
                        debug!(source = %name, error = %e, "Event dropped");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(source = %name, error = %format!("{:#}", e), "Source poll failed"),
            }
            self.sleep_while_running(interval);
        }

        info!(source = %name, handled, "Source stopped");
        handled
    }

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
        }
    }
}
