//! 设备开关控制

use anyhow::{anyhow, Context, Result};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

use crate::exec::run_with_timeout;

/// 设置设备的启用标志；`Ok(false)` 表示控制端拒绝
pub trait DeviceControl: Send + Sync {
    fn set_enabled(&self, device: &str, enabled: bool) -> Result<bool>;
}

/// 通过外部命令切换设备，例如：
/// `["mosquitto_pub", "-t", "frigate/{device}/enabled/set", "-m", "{state}"]`
pub struct CommandDeviceControl {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandDeviceControl {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!("device_command must name a program"));
        }
        Ok(Self {
            argv,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 替换占位符后的命令行
    pub fn render(&self, device: &str, enabled: bool) -> Vec<String> {
        let state = if enabled { "ON" } else { "OFF" };
        self.argv
            .iter()
            .map(|arg| arg.replace("{device}", device).replace("{state}", state))
            .collect()
    }
}

impl DeviceControl for CommandDeviceControl {
    fn set_enabled(&self, device: &str, enabled: bool) -> Result<bool> {
        let argv = self.render(device, enabled);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        let output = run_with_timeout(&mut cmd, None, self.timeout)
            .with_context(|| format!("failed to run {}", argv[0]))?;
        if output.timed_out() {
            return Err(anyhow!("{} did not finish within {:?}", argv[0], self.timeout));
        }
        if output.success() {
            info!(device = %device, enabled, "Device flag updated");
            Ok(true)
        } else {
            warn!(
                device = %device,
                enabled,
                status = ?output.status,
                error = %output.stderr.trim(),
                "Device control command failed"
            );
            Ok(false)
        }
    }
}
