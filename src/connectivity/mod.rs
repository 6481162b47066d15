//! 摄像头连通性对账
//!
//! 每次对账独立完成：
//! 1. 例外列表中的设备直接使用配置值（即使未被发现）
//! 2. 其余设备探测 RTSP 端口，结果即启用标志
//! 3. 与上次已生效的标志不同时才调用 `DeviceControl`

pub mod device_control;
pub mod probe;

pub use device_control::{CommandDeviceControl, DeviceControl};
pub use probe::{NetcatProbe, Probe, TcpProbe};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::NotifyError;

/// 例外状态：无视探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionState {
    Enabled,
    Disabled,
}

impl ExceptionState {
    pub fn is_enabled(self) -> bool {
        self == ExceptionState::Enabled
    }
}

impl FromStr for ExceptionState {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "enable" | "on" => Ok(ExceptionState::Enabled),
            "disabled" | "disable" | "off" => Ok(ExceptionState::Disabled),
            other => Err(NotifyError::Config(format!(
                "invalid exception state '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ExceptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExceptionState::Enabled => "enabled",
            ExceptionState::Disabled => "disabled",
        })
    }
}

/// 单个设备在本轮对账中的状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub ip: Option<String>,
    pub is_online: bool,
    pub is_exception: bool,
}

pub struct ConnectivityReconciler {
    control: Option<Arc<dyn DeviceControl>>,
    port: u16,
    timeout: Duration,
    last_known: Mutex<HashMap<String, bool>>,
    dry_run: bool,
}

impl ConnectivityReconciler {
    pub fn new(control: Option<Arc<dyn DeviceControl>>) -> Self {
        Self {
            control,
            port: 554,
            timeout: Duration::from_secs(1),
            last_known: Mutex::new(HashMap::new()),
            dry_run: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// dry-run 只记录将要做的变更
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn last_known(&self, device: &str) -> Option<bool> {
        self.last_known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .copied()
    }

    /// 设备名 -> 启用标志
    pub fn reconcile(
        &self,
        discovered: &BTreeMap<String, String>,
        exceptions: &BTreeMap<String, ExceptionState>,
        probe: &dyn Probe,
    ) -> BTreeMap<String, bool> {
        self.reconcile_detailed(discovered, exceptions, probe)
            .into_iter()
            .map(|(name, status)| (name, status.is_online))
            .collect()
    }

    /// 对账并返回每个设备的完整状态
    pub fn reconcile_detailed(
        &self,
        discovered: &BTreeMap<String, String>,
        exceptions: &BTreeMap<String, ExceptionState>,
        probe: &dyn Probe,
    ) -> BTreeMap<String, DeviceStatus> {
        let statuses = self.survey(discovered, exceptions, probe);
        for (name, status) in &statuses {
            self.apply(name, status.is_online);
        }
        info!(
            devices = statuses.len(),
            online = statuses.values().filter(|s| s.is_online).count(),
            dry_run = self.dry_run,
            "Connectivity reconciliation finished"
        );
        statuses
    }

    /// 只计算状态，不产生副作用
    pub fn survey(
        &self,
        discovered: &BTreeMap<String, String>,
        exceptions: &BTreeMap<String, ExceptionState>,
        probe: &dyn Probe,
    ) -> BTreeMap<String, DeviceStatus> {
        if discovered.is_empty() {
            warn!("No devices discovered, only exceptions will be applied");
        }

        let mut statuses = BTreeMap::new();
        for (name, state) in exceptions {
            statuses.insert(
                name.clone(),
                DeviceStatus {
                    ip: discovered.get(name).cloned(),
                    is_online: state.is_enabled(),
                    is_exception: true,
                },
            );
        }

        for (name, host) in discovered {
            if exceptions.contains_key(name) {
                continue;
            }
            let online = probe.tcp_check(host, self.port, self.timeout);
            debug!(device = %name, host = %host, port = self.port, online, "Probed device");
            statuses.insert(
                name.clone(),
                DeviceStatus {
                    ip: Some(host.clone()),
                    is_online: online,
                    is_exception: false,
                },
            );
        }
        statuses
    }

    fn apply(&self, device: &str, enabled: bool) {
        if self.last_known(device) == Some(enabled) {
            return;
        }

        if self.dry_run {
            info!(device = %device, enabled, "Dry run: would update device flag");
            return;
        }

        let Some(control) = &self.control else {
            info!(device = %device, enabled, "Device flag changed");
            self.remember(device, enabled);
            return;
        };

        match control.set_enabled(device, enabled) {
            Ok(true) => self.remember(device, enabled),
            Ok(false) => {
                warn!(device = %device, enabled, "Device control rejected flag change")
            }
            Err(e) => {
                warn!(device = %device, enabled, error = %e, "Device control failed")
            }
        }
    }

    fn remember(&self, device: &str, enabled: bool) {
        self.last_known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.to_string(), enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// 只有给定主机在线
    struct FixedProbe {
        online: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FixedProbe {
        fn new(online: &[&str]) -> Self {
            Self {
                online: online.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Probe for FixedProbe {
        fn tcp_check(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
            self.calls.lock().unwrap().push(host.to_string());
            self.online.contains(host)
        }
    }

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<(String, bool)>>,
        reject: bool,
    }

    impl DeviceControl for RecordingControl {
        fn set_enabled(&self, device: &str, enabled: bool) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push((device.to_string(), enabled));
            Ok(!self.reject)
        }
    }

    fn discovered() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cam1".to_string(), "10.0.0.1".to_string()),
            ("cam2".to_string(), "10.0.0.2".to_string()),
        ])
    }

    #[test]
    fn test_exception_overrides_probe() {
        let reconciler = ConnectivityReconciler::new(None);
        let exceptions = BTreeMap::from([("cam1".to_string(), ExceptionState::Enabled)]);
        let probe = FixedProbe::new(&[]);

        let flags = reconciler.reconcile(&discovered(), &exceptions, &probe);
        assert_eq!(flags["cam1"], true);
        assert_eq!(flags["cam2"], false);
        // 例外设备不探测
        assert_eq!(*probe.calls.lock().unwrap(), vec!["10.0.0.2"]);
    }

    #[test]
    fn test_undiscovered_exception_still_applied() {
        let reconciler = ConnectivityReconciler::new(None);
        let exceptions = BTreeMap::from([("attic".to_string(), ExceptionState::Disabled)]);
        let statuses =
            reconciler.reconcile_detailed(&BTreeMap::new(), &exceptions, &FixedProbe::new(&[]));
        assert_eq!(
            statuses["attic"],
            DeviceStatus {
                ip: None,
                is_online: false,
                is_exception: true
            }
        );
    }

    #[test]
    fn test_control_called_only_on_change() {
        let control = Arc::new(RecordingControl::default());
        let reconciler = ConnectivityReconciler::new(Some(control.clone()));
        let probe = FixedProbe::new(&["10.0.0.1"]);

        reconciler.reconcile(&discovered(), &BTreeMap::new(), &probe);
        assert_eq!(control.calls.lock().unwrap().len(), 2);

        // 状态不变，不再调用
        reconciler.reconcile(&discovered(), &BTreeMap::new(), &probe);
        assert_eq!(control.calls.lock().unwrap().len(), 2);

        // cam1 离线
        let probe = FixedProbe::new(&[]);
        reconciler.reconcile(&discovered(), &BTreeMap::new(), &probe);
        let calls = control.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], ("cam1".to_string(), false));
    }

    #[test]
    fn test_rejected_change_is_retried() {
        let control = Arc::new(RecordingControl {
            reject: true,
            ..Default::default()
        });
        let reconciler = ConnectivityReconciler::new(Some(control.clone()));
        let probe = FixedProbe::new(&["10.0.0.1", "10.0.0.2"]);

        reconciler.reconcile(&discovered(), &BTreeMap::new(), &probe);
        reconciler.reconcile(&discovered(), &BTreeMap::new(), &probe);
        assert_eq!(control.calls.lock().unwrap().len(), 4);
        assert_eq!(reconciler.last_known("cam1"), None);
    }

    #[test]
    fn test_dry_run_has_no_side_effects() {
        let control = Arc::new(RecordingControl::default());
        let reconciler = ConnectivityReconciler::new(Some(control.clone())).with_dry_run(true);
        let flags = reconciler.reconcile(&discovered(), &BTreeMap::new(), &FixedProbe::new(&["10.0.0.2"]));
        assert_eq!(flags["cam2"], true);
        assert!(control.calls.lock().unwrap().is_empty());
        assert_eq!(reconciler.last_known("cam2"), None);
    }

    #[test]
    fn test_exception_state_parse() {
        assert_eq!("Enabled".parse::<ExceptionState>().unwrap(), ExceptionState::Enabled);
        assert_eq!(" off ".parse::<ExceptionState>().unwrap(), ExceptionState::Disabled);
        assert!(matches!(
            "sometimes".parse::<ExceptionState>(),
            Err(NotifyError::Config(_))
        ));
    }
}
