//! run 命令 - 轮询所有配置的来源，直到 Ctrl-C
//!
//! 每个来源在独立的阻塞线程上运行，共享同一个引擎。

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::source::{build_sources, ConfiguredSource};
use crate::vendor::VendorRegistry;

/// run 命令参数
#[derive(Args, Clone)]
pub struct RunArgs {
    /// 只渲染，不发送、不记录
    #[arg(long)]
    pub dry_run: bool,
}

/// 处理 run 命令
pub async fn handle_run(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dry_run = args.dry_run;

    // HTTP 客户端必须在阻塞线程上创建和释放
    let (engine, sources) = tokio::task::spawn_blocking(move || -> Result<_> {
        let engine = Engine::from_config(&config, clock.clone(), dry_run)?;
        let sources = build_sources(&config, &VendorRegistry::with_builtin(), clock)?;
        Ok((Arc::new(engine), sources))
    })
    .await
    .map_err(|e| anyhow!("startup task failed: {}", e))??;

    if sources.is_empty() {
        warn!("No sources or doorbells configured, nothing to run");
        release(engine).await;
        return Ok(());
    }

    engine.start();
    let mut handles = Vec::with_capacity(sources.len());
    for ConfiguredSource { mut source, interval } in sources {
        let engine = engine.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            engine.run_source(source.as_mut(), interval)
        }));
    }
    info!(sources = handles.len(), dry_run, "Event notifier running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C, stopping");
    }
    engine.shutdown();

    let mut handled = 0;
    for handle in handles {
        match handle.await {
            Ok(count) => handled += count,
            Err(e) => error!(error = %e, "Source task panicked"),
        }
    }
    info!(handled, "All sources stopped");

    release(engine).await;
    Ok(())
}

async fn release(engine: Arc<Engine>) {
    let _ = tokio::task::spawn_blocking(move || drop(engine)).await;
}
