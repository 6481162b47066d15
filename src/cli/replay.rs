//! replay 命令 - 将 JSONL 文件中的事件逐条送入引擎

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::output::format_output;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::event::SourceKind;
use crate::notification::DispatchOutcome;
use crate::source::JsonlFileSource;

/// replay 命令参数
#[derive(Args, Clone)]
pub struct ReplayArgs {
    /// JSONL 事件文件
    pub file: PathBuf,

    /// 没有显式 source 的行使用的来源类型
    #[arg(long, short, default_value = "message_bus")]
    pub source: String,

    /// 只渲染，不发送、不记录
    #[arg(long)]
    pub dry_run: bool,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// 回放统计
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub malformed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReplaySummary {
    fn tally(&mut self, outcomes: &[(String, DispatchOutcome)]) {
        for (_, outcome) in outcomes {
            match outcome {
                DispatchOutcome::Sent => self.sent += 1,
                DispatchOutcome::Skipped(_) => self.skipped += 1,
                DispatchOutcome::Failed(_) => self.failed += 1,
            }
        }
    }
}

/// 用给定引擎回放文件
pub fn replay_file(engine: &Engine, file: &Path, default_kind: SourceKind) -> Result<ReplaySummary> {
    if !file.exists() {
        anyhow::bail!("event file {} does not exist", file.display());
    }
    let mut source = JsonlFileSource::new(file, default_kind);
    let events = source
        .read_new_events()
        .with_context(|| format!("cannot read {}", file.display()))?;

    let mut summary = ReplaySummary::default();
    for raw in events {
        summary.events += 1;
        match engine.handle(raw) {
            Ok(outcomes) => summary.tally(&outcomes),
            Err(_) => summary.malformed += 1,
        }
    }
    info!(
        file = %file.display(),
        events = summary.events,
        sent = summary.sent,
        skipped = summary.skipped,
        failed = summary.failed,
        malformed = summary.malformed,
        "Replay finished"
    );
    Ok(summary)
}

/// 处理 replay 命令（阻塞，需在 `spawn_blocking` 中调用）
pub fn handle_replay(config_path: &Path, args: ReplayArgs) -> Result<ReplaySummary> {
    let config = AppConfig::load(config_path)?;
    let default_kind: SourceKind = args.source.parse()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::from_config(&config, clock, args.dry_run)?;

    let summary = replay_file(&engine, &args.file, default_kind)?;
    if args.json {
        println!("{}", format_output(&summary, true));
    } else {
        println!(
            "Replayed {} events: {} sent, {} skipped, {} failed, {} malformed",
            summary.events, summary.sent, summary.skipped, summary.failed, summary.malformed
        );
    }
    Ok(summary)
}
