//! 离线检查命令：validate / match / quiet
//!
//! 不访问网络，只读取配置和命令行输入。

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use clap::Args;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::output::format_output;
use crate::clock::SystemClock;
use crate::config::AppConfig;
use crate::event::{EventNormalizer, NormalizedEvent, SourceKind};
use crate::rules::{parse_time_of_day, QuietHours};

/// validate 命令参数
#[derive(Args)]
pub struct ValidateArgs {
    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub subject_pattern: String,
    pub kind_pattern: String,
    pub targets: Vec<String>,
    pub min_score: f64,
    pub min_hysteresis_seconds: f64,
    pub quiet_hours: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ValidateOutput {
    pub config: String,
    pub rules: Vec<RuleSummary>,
    pub sources: Vec<String>,
    pub doorbells: Vec<String>,
    pub exceptions: usize,
    pub delivery: String,
}

/// 处理 validate 命令：加载并校验配置
pub fn handle_validate(config_path: &Path, args: ValidateArgs) -> Result<()> {
    let config = AppConfig::load(config_path)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    let rules = config.rule_set()?;

    let output = ValidateOutput {
        config: config_path.display().to_string(),
        rules: rules
            .rules()
            .iter()
            .map(|r| RuleSummary {
                name: r.name.clone(),
                subject_pattern: r.subject_pattern.clone(),
                kind_pattern: r.kind_pattern.clone(),
                targets: r.targets.clone(),
                min_score: r.min_score,
                min_hysteresis_seconds: r.min_hysteresis_seconds,
                quiet_hours: r.quiet_hours.map(|q| q.to_string()),
                enabled: r.enabled,
            })
            .collect(),
        sources: config.sources.iter().map(|s| s.display_name()).collect(),
        doorbells: config.doorbells.keys().cloned().collect(),
        exceptions: config.connectivity.exceptions.len(),
        delivery: config.delivery.method.as_str().to_string(),
    };

    if args.json {
        println!("{}", format_output(&output, true));
        return Ok(());
    }

    println!("✅ {} is valid", output.config);
    println!("Rules ({}):", output.rules.len());
    for rule in &output.rules {
        let state = if rule.enabled { "" } else { " (disabled)" };
        println!(
            "  - {}{}: {} / {} -> {} (score >= {}, every {}s{})",
            rule.name,
            state,
            rule.subject_pattern,
            rule.kind_pattern,
            rule.targets.join(", "),
            rule.min_score,
            rule.min_hysteresis_seconds,
            rule.quiet_hours
                .as_ref()
                .map(|q| format!(", quiet {}", q))
                .unwrap_or_default()
        );
    }
    println!("Sources: {}", output.sources.len());
    println!("Doorbells: {}", output.doorbells.len());
    println!("Connectivity exceptions: {}", output.exceptions);
    println!("Delivery: {}", output.delivery);
    Ok(())
}

/// match 命令参数
#[derive(Args)]
pub struct MatchArgs {
    /// 事件 JSON，或 @文件路径
    pub event: String,

    /// 来源类型: message_bus, camera_api, hub_webhook
    #[arg(long, short, default_value = "message_bus")]
    pub source: String,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct MatchOutput {
    pub event: NormalizedEvent,
    pub rules: Vec<String>,
}

/// 处理 match 命令：显示哪些规则匹配给定事件
pub fn handle_match(config_path: &Path, args: MatchArgs) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let rules = config.rule_set()?;
    let source: SourceKind = args.source.parse()?;

    let raw = match args.event.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read event file {}", path))?,
        None => args.event.clone(),
    };

    let normalizer = EventNormalizer::new(Arc::new(SystemClock));
    let event = normalizer.normalize(source, &raw)?;
    let output = MatchOutput {
        rules: rules.matching(&event).iter().map(|r| r.name.clone()).collect(),
        event,
    };

    if args.json {
        println!("{}", format_output(&output, true));
        return Ok(());
    }

    println!(
        "Event: {} / {} ({}, top score {:.2})",
        output.event.subject_id, output.event.kind, output.event.phase, output.event.top_score
    );
    if output.rules.is_empty() {
        println!("No rules matched");
    } else {
        for name in &output.rules {
            println!("  ✓ {}", name);
        }
    }
    Ok(())
}

/// quiet 命令参数
#[derive(Args)]
pub struct QuietArgs {
    /// 开始时间 (HH:MM)
    #[arg(long)]
    pub start: String,

    /// 结束时间 (HH:MM)
    #[arg(long)]
    pub end: String,

    /// 判断的时间 (HH:MM)，默认当前本地时间
    #[arg(long)]
    pub at: Option<String>,
}

/// 处理 quiet 命令，返回是否处于免打扰时段
pub fn handle_quiet(args: QuietArgs) -> Result<bool> {
    let window = QuietHours::parse(&args.start, &args.end)?;
    let at: NaiveTime = match &args.at {
        Some(at) => parse_time_of_day(at)?,
        None => Local::now().time(),
    };
    let quiet = window.contains(at);
    println!(
        "{} is {} {}",
        at.format("%H:%M"),
        if quiet { "inside" } else { "outside" },
        window
    );
    Ok(quiet)
}
