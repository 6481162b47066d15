//! 主机可达性探测

use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use crate::exec::run_with_timeout;

/// TCP 端口探测；超时、解析失败、工具缺失都视为离线
pub trait Probe: Send + Sync {
    fn tcp_check(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// 直接建立 TCP 连接
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn tcp_check(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host = %host, error = %e, "Cannot resolve host");
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
    }
}

/// 调用 `nc -z -w <secs> host port`
#[derive(Debug, Default, Clone, Copy)]
pub struct NetcatProbe;

impl Probe for NetcatProbe {
    fn tcp_check(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let nc = match which::which("nc") {
            Ok(path) => path,
            Err(_) => {
                warn!(host = %host, "nc not found in PATH, treating device as offline");
                return false;
            }
        };

        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut cmd = Command::new(nc);
        cmd.args(["-z", "-w", &wait_secs, host, &port.to_string()]);

        // nc 自身的 -w 之外再留一秒余量
        match run_with_timeout(&mut cmd, None, timeout + Duration::from_secs(1)) {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to run nc");
                false
            }
        }
    }
}
