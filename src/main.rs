//! Event Notifier CLI
//!
//! 摄像头、门铃、局域网事件 → 规则匹配 → 邮件通知

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use event_notifier::cli::{
    handle_match, handle_quiet, handle_reconcile, handle_replay, handle_run, handle_validate,
    MatchArgs, QuietArgs, ReconcileArgs, ReplayArgs, RunArgs, ValidateArgs,
};
use event_notifier::config::AppConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "evn")]
#[command(about = "Event Notifier - 摄像头与门铃事件的规则化邮件通知")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ./event-notifier.yml）
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// 输出调试日志
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 校验配置文件并列出规则
    Validate(ValidateArgs),
    /// 显示与给定事件匹配的规则
    Match(MatchArgs),
    /// 将 JSONL 文件中的事件送入引擎
    Replay(ReplayArgs),
    /// 执行一次摄像头连通性对账
    Reconcile(ReconcileArgs),
    /// 轮询所有配置的来源，直到 Ctrl-C
    Run(RunArgs),
    /// 判断某个时间是否处于免打扰时段
    Quiet(QuietArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=event_notifier=debug evn run
    let default_filter = if cli.verbose {
        "event_notifier=debug,evn=debug"
    } else {
        "event_notifier=info,evn=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::Validate(args) => handle_validate(&config_path, args)?,
        Commands::Match(args) => handle_match(&config_path, args)?,
        Commands::Replay(args) => {
            tokio::task::spawn_blocking(move || handle_replay(&config_path, args))
                .await
                .map_err(|e| anyhow!("replay task failed: {}", e))??;
        }
        Commands::Reconcile(args) => {
            tokio::task::spawn_blocking(move || handle_reconcile(&config_path, args))
                .await
                .map_err(|e| anyhow!("reconcile task failed: {}", e))??;
        }
        Commands::Run(args) => handle_run(&config_path, args).await?,
        Commands::Quiet(args) => {
            if !handle_quiet(args)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
