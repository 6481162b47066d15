//! reconcile 命令 - 执行一次摄像头连通性对账

use anyhow::Result;
use clap::Args;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use super::output::format_output;
use crate::config::{AppConfig, ProbeKind};
use crate::connectivity::{
    CommandDeviceControl, ConnectivityReconciler, DeviceControl, DeviceStatus, NetcatProbe, Probe,
    TcpProbe,
};
use crate::nvr::NvrClient;

/// reconcile 命令参数
#[derive(Args, Clone)]
pub struct ReconcileArgs {
    /// 只探测并显示结果，不切换设备
    #[arg(long)]
    pub dry_run: bool,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// 静态设备 + NVR 发现的摄像头；同名时静态配置优先
pub fn discover_devices(config: &AppConfig) -> BTreeMap<String, String> {
    let mut devices = BTreeMap::new();
    if config.connectivity.discover {
        match NvrClient::new(config.frigate.clone()).and_then(|c| c.discover_cameras()) {
            Ok(cameras) => devices.extend(cameras),
            Err(e) => warn!(error = %format!("{:#}", e), "Camera discovery failed"),
        }
    }
    devices.extend(config.connectivity.devices.clone());
    devices
}

/// 处理 reconcile 命令（阻塞，需在 `spawn_blocking` 中调用）
pub fn handle_reconcile(config_path: &Path, args: ReconcileArgs) -> Result<BTreeMap<String, DeviceStatus>> {
    let config = AppConfig::load(config_path)?;
    let exceptions = config.exceptions()?;
    let discovered = discover_devices(&config);

    let probe: Box<dyn Probe> = match config.connectivity.probe {
        ProbeKind::Tcp => Box::new(TcpProbe),
        ProbeKind::Netcat => Box::new(NetcatProbe),
    };
    let control: Option<Arc<dyn DeviceControl>> = match &config.connectivity.device_command {
        Some(argv) => Some(Arc::new(CommandDeviceControl::new(argv.clone())?)),
        None => None,
    };

    let reconciler = ConnectivityReconciler::new(control)
        .with_port(config.connectivity.port)
        .with_timeout(config.connectivity.timeout())
        .with_dry_run(args.dry_run);
    let statuses = reconciler.reconcile_detailed(&discovered, &exceptions, probe.as_ref());

    if args.json {
        println!("{}", format_output(&statuses, true));
    } else {
        for (name, status) in &statuses {
            let icon = if status.is_online { "🟢" } else { "🔴" };
            let note = if status.is_exception { " (exception)" } else { "" };
            println!(
                "{} {} {}{}",
                icon,
                name,
                status.ip.as_deref().unwrap_or("-"),
                note
            );
        }
    }
    Ok(statuses)
}
