//! 局域网客户端监控
//!
//! 定期读取邻居表（默认 `ip neigh`），产生两类事件：
//! - `new_device`：未登记的 MAC 首次出现（首轮快照只作为基线）
//! - `arrived` / `departed`：已登记设备上线、离线
//!
//! 同一设备的重复提醒由规则的 hysteresis 控制。
//!
//! 事件 details 带上厂商（OUI 表查询）和主机名（可选的 `arp -a` 输出）。

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::edge::DebouncedEdgeDetector;
use crate::event::{EventPhase, NormalizedEvent};
use crate::exec::run_with_timeout;
use crate::source::{EventSource, RawEvent};

pub const NEW_DEVICE_KIND: &str = "new_device";
pub const UNKNOWN: &str = "Unknown";
pub const LOCALLY_ADMINISTERED: &str = "Locally administered";

/// OUI 前缀（"XX:XX:XX"，大写）-> 厂商名
pub type OuiMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanClient {
    pub ip: String,
    pub mac: String,
    pub state: String,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
}

impl LanClient {
    pub fn new(ip: impl Into<String>, mac: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: mac.into(),
            state: state.into(),
            vendor: None,
            hostname: None,
        }
    }

    fn vendor_or_unknown(&self) -> String {
        self.vendor.clone().unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn hostname_or_unknown(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| UNKNOWN.to_string())
    }
}

/// MAC 的 OUI 前缀，格式 "XX:XX:XX"
pub fn oui_prefix(mac: &str) -> Option<String> {
    let hex: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6]))
}

/// 第一个字节的 0x02 位表示本地管理地址（随机 MAC）
pub fn is_locally_administered(mac: &str) -> bool {
    oui_prefix(mac)
        .and_then(|oui| u8::from_str_radix(&oui[0..2], 16).ok())
        .map_or(false, |b| b & 0x02 != 0)
}

/// 查询厂商；本地管理地址不查表
pub fn lookup_vendor(mac: &str, ouis: &OuiMap) -> Option<String> {
    if is_locally_administered(mac) {
        return Some(LOCALLY_ADMINISTERED.to_string());
    }
    ouis.get(&oui_prefix(mac)?).cloned()
}

/// 解析 OUI 表
///
/// 每行 `<前缀> <厂商>`，前缀可以是 `00:1A:2B`、`00-1A-2B` 或 `001A2B`，
/// 兼容 IEEE `oui.txt` 的 `00-1A-2B   (hex)\t\tVendor` 行。`#` 开头为注释。
pub fn parse_oui_table(text: &str) -> OuiMap {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (prefix, rest) = line.split_once(char::is_whitespace)?;
            let vendor = rest.trim().trim_start_matches("(hex)").trim();
            if vendor.is_empty() {
                return None;
            }
            Some((oui_prefix(prefix)?, vendor.to_string()))
        })
        .collect()
}

pub fn load_oui_table(path: &Path) -> Result<OuiMap> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read OUI table {}", path.display()))?;
    Ok(parse_oui_table(&text))
}

/// 解析 `arp -a` 输出为 IP -> 主机名
///
/// `?` 视为未知；以 `.` 结尾的 mDNS 名补全为 `.local`
pub fn parse_arp_table(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.trim().split_once(" (")?;
            let (ip, tail) = rest.split_once(')')?;
            if !tail.trim_start().starts_with("at") {
                return None;
            }
            let mut name = name.trim().to_lowercase();
            if name.is_empty() || name == "?" {
                return None;
            }
            if name.ends_with('.') {
                name.push_str("local");
            }
            Some((ip.to_string(), name))
        })
        .collect()
}

/// 解析 `ip neigh` 输出
///
/// 只接受 `<ip> dev <if> lladdr <mac> <state>` 六段格式，跳过 FAILED/INCOMPLETE，按 IP 排序
pub fn parse_ip_neigh(output: &str) -> Vec<LanClient> {
    let mut clients: Vec<LanClient> = output
        .lines()
        .filter_map(|line| {
            let toks: Vec<&str> = line.split_whitespace().collect();
            if toks.len() != 6 {
                return None;
            }
            let state = toks[5];
            if state == "FAILED" || state == "INCOMPLETE" {
                return None;
            }
            Some(LanClient::new(toks[0], toks[4].to_ascii_lowercase(), state))
        })
        .collect();
    clients.sort_by_key(|c| (c.ip.parse::<Ipv4Addr>().ok(), c.ip.clone()));
    clients
}

/// 解析 "<mac> <别名...>" 形式的登记项
pub fn parse_known_macs(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut parts = entry.split_whitespace();
            let mac = parts.next()?.to_ascii_lowercase();
            let alias = parts.collect::<Vec<_>>().join(" ");
            Some((mac, alias))
        })
        .collect()
}

/// 未登记设备检测
pub struct NewClientDetector {
    known: HashSet<String>,
    last: Option<HashSet<String>>,
}

impl NewClientDetector {
    pub fn new<I, S>(known_macs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            known: known_macs
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
            last: None,
        }
    }

    /// 与上一轮快照比较，返回新出现的未登记设备事件
    pub fn diff(&mut self, clients: &[LanClient], at: f64) -> Vec<NormalizedEvent> {
        let current: HashSet<String> = clients
            .iter()
            .map(|c| c.mac.clone())
            .filter(|mac| !self.known.contains(mac))
            .collect();

        let Some(last) = self.last.replace(current.clone()) else {
            debug!(clients = clients.len(), "Recorded LAN baseline");
            return Vec::new();
        };

        clients
            .iter()
            .filter(|c| current.contains(&c.mac) && !last.contains(&c.mac))
            .map(|c| {
                info!(mac = %c.mac, ip = %c.ip, vendor = ?c.vendor, "New LAN client");
                NormalizedEvent::new(c.mac.clone(), NEW_DEVICE_KIND, at)
                    .with_phase(EventPhase::New)
                    .with_score(1.0)
                    .with_detail("ip", c.ip.clone())
                    .with_detail("mac", c.mac.clone())
                    .with_detail("vendor", c.vendor_or_unknown())
                    .with_detail("hostname", c.hostname_or_unknown())
            })
            .collect()
    }
}

/// 已登记设备的上线 / 离线检测
pub struct PresenceMonitor {
    devices: BTreeMap<String, (String, DebouncedEdgeDetector)>,
}

impl PresenceMonitor {
    /// `devices`: MAC -> 别名（为空时用 MAC 作为名称）
    pub fn new(devices: &BTreeMap<String, String>, debounce_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        let devices = devices
            .iter()
            .map(|(mac, alias)| {
                let name = if alias.is_empty() { mac.clone() } else { alias.clone() };
                let detector = DebouncedEdgeDetector::new(debounce_seconds, clock.clone())
                    .with_falling_edges(true);
                (mac.clone(), (name, detector))
            })
            .collect();
        Self { devices }
    }

    pub fn observe(&mut self, clients: &[LanClient], at: f64) -> Vec<NormalizedEvent> {
        let present: HashMap<&str, &LanClient> =
            clients.iter().map(|c| (c.mac.as_str(), c)).collect();

        let mut events = Vec::new();
        for (mac, (name, detector)) in self.devices.iter_mut() {
            let client = present.get(mac.as_str());
            let Some(edge) = detector.observe(client.is_some()) else {
                continue;
            };
            let kind = edge.presence_kind();
            info!(device = %name, mac = %mac, kind, "LAN presence changed");
            let mut event = NormalizedEvent::new(name.clone(), kind, at)
                .with_phase(EventPhase::New)
                .with_score(1.0)
                .with_detail("mac", mac.clone());
            if let Some(client) = client {
                event = event
                    .with_detail("ip", client.ip.clone())
                    .with_detail("vendor", client.vendor_or_unknown());
            }
            events.push(event);
        }
        events
    }
}

/// 以命令输出为数据源的 LAN 来源
pub struct LanSource {
    name: String,
    argv: Vec<String>,
    arp_argv: Option<Vec<String>>,
    ouis: OuiMap,
    timeout: Duration,
    new_clients: NewClientDetector,
    presence: PresenceMonitor,
    clock: Arc<dyn Clock>,
    pending: VecDeque<NormalizedEvent>,
}

impl LanSource {
    pub fn new(name: impl Into<String>, argv: Option<Vec<String>>, known_macs: &[String], clock: Arc<dyn Clock>) -> Self {
        let known = parse_known_macs(known_macs);
        Self {
            name: name.into(),
            argv: argv
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| vec!["ip".to_string(), "neigh".to_string()]),
            arp_argv: None,
            ouis: OuiMap::new(),
            timeout: Duration::from_secs(10),
            new_clients: NewClientDetector::new(known.keys()),
            presence: PresenceMonitor::new(&known, 0.0, clock.clone()),
            clock,
            pending: VecDeque::new(),
        }
    }

    /// 厂商查询表
    pub fn with_oui_table(mut self, ouis: OuiMap) -> Self {
        self.ouis = ouis;
        self
    }

    /// 主机名来源命令（`arp -a` 格式输出）
    pub fn with_arp_command(mut self, argv: Option<Vec<String>>) -> Self {
        self.arp_argv = argv.filter(|a| !a.is_empty());
        self
    }

    /// 执行命令读取当前客户端列表，并补充厂商和主机名
    pub fn read_clients(&self) -> Result<Vec<LanClient>> {
        let mut clients = parse_ip_neigh(&self.run(&self.argv)?);

        let hostnames = match &self.arp_argv {
            Some(argv) => match self.run(argv) {
                Ok(output) => parse_arp_table(&output),
                Err(e) => {
                    warn!(source = %self.name, error = %format!("{:#}", e), "Hostname lookup failed");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        for client in &mut clients {
            client.vendor = lookup_vendor(&client.mac, &self.ouis);
            client.hostname = hostnames.get(&client.ip).cloned();
        }
        Ok(clients)
    }

    fn run(&self, argv: &[String]) -> Result<String> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        let output = run_with_timeout(&mut cmd, None, self.timeout)
            .with_context(|| format!("failed to run {}", argv.join(" ")))?;
        if !output.success() {
            return Err(anyhow!("{} failed: {}", argv.join(" "), output.stderr.trim()));
        }
        Ok(output.stdout)
    }

    /// 处理一轮快照
    pub fn ingest(&mut self, clients: &[LanClient]) {
        let at = self.clock.now();
        self.pending.extend(self.new_clients.diff(clients, at));
        self.pending.extend(self.presence.observe(clients, at));
    }
}

impl EventSource for LanSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Result<Option<RawEvent>> {
        if self.pending.is_empty() {
            let clients = self.read_clients()?;
            self.ingest(&clients);
        }
        Ok(self.pending.pop_front().map(RawEvent::Normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const NEIGH: &str = "\
192.168.1.10 dev br0 lladdr AA:BB:CC:00:00:10 REACHABLE
192.168.1.2 dev br0 lladdr aa:bb:cc:00:00:02 STALE
192.168.1.3 dev br0  FAILED
192.168.1.4 dev br0 lladdr aa:bb:cc:00:00:04 INCOMPLETE
fe80::1 dev br0 lladdr aa:bb:cc:00:00:99 router REACHABLE
";

    fn client(ip: &str, mac: &str) -> LanClient {
        LanClient::new(ip, mac, "REACHABLE")
    }

    #[test]
    fn test_parse_ip_neigh() {
        let clients = parse_ip_neigh(NEIGH);
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].ip, "192.168.1.2");
        assert_eq!(clients[1].mac, "aa:bb:cc:00:00:10");
    }

    #[test]
    fn test_parse_known_macs() {
        let known = parse_known_macs(&["AA:BB:CC:00:00:01 Kitchen Tablet".into(), "aa:bb:cc:00:00:02".into()]);
        assert_eq!(known["aa:bb:cc:00:00:01"], "Kitchen Tablet");
        assert_eq!(known["aa:bb:cc:00:00:02"], "");
    }

    #[test]
    fn test_new_client_after_baseline() {
        let mut detector = NewClientDetector::new(["aa:aa:aa:aa:aa:01"]);
        let baseline = vec![client("10.0.0.1", "aa:aa:aa:aa:aa:01"), client("10.0.0.2", "bb:bb:bb:bb:bb:02")];
        assert!(detector.diff(&baseline, 1.0).is_empty());

        let mut next = baseline.clone();
        next.push(client("10.0.0.3", "cc:cc:cc:cc:cc:03"));
        let events = detector.diff(&next, 2.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject_id, "cc:cc:cc:cc:cc:03");
        assert_eq!(events[0].kind, NEW_DEVICE_KIND);
        assert_eq!(events[0].phase, EventPhase::New);
        assert_eq!(events[0].details["ip"], "10.0.0.3");
        assert_eq!(events[0].details["vendor"], UNKNOWN);

        // 仍在线不重复
        assert!(detector.diff(&next, 3.0).is_empty());
        // 离开后再回来会再次报告（由 hysteresis 限流）
        assert!(detector.diff(&baseline, 4.0).is_empty());
        assert_eq!(detector.diff(&next, 5.0).len(), 1);
    }

    #[test]
    fn test_known_client_never_reported() {
        let mut detector = NewClientDetector::new(["AA:AA:AA:AA:AA:01"]);
        detector.diff(&[], 1.0);
        assert!(detector.diff(&[client("10.0.0.1", "aa:aa:aa:aa:aa:01")], 2.0).is_empty());
    }

    #[test]
    fn test_presence_arrive_and_depart() {
        let clock = Arc::new(ManualClock::new(0.0));
        let devices = BTreeMap::from([("aa:aa:aa:aa:aa:01".to_string(), "Phone".to_string())]);
        let mut monitor = PresenceMonitor::new(&devices, 0.0, clock.clone());

        assert!(monitor.observe(&[], 0.0).is_empty());
        clock.advance(1.0);
        let arrived = monitor.observe(&[client("10.0.0.5", "aa:aa:aa:aa:aa:01")], 1.0);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].subject_id, "Phone");
        assert_eq!(arrived[0].kind, "arrived");
        assert_eq!(arrived[0].details["ip"], "10.0.0.5");

        clock.advance(1.0);
        let departed = monitor.observe(&[], 2.0);
        assert_eq!(departed[0].kind, "departed");
    }

    #[cfg(unix)]
    #[test]
    fn test_lan_source_runs_command() {
        let clock = Arc::new(ManualClock::new(0.0));
        let argv = vec!["sh".to_string(), "-c".to_string(), format!("printf '{}'", "10.0.0.9 dev br0 lladdr dd:dd:dd:dd:dd:09 REACHABLE\\n")];
        let mut source = LanSource::new("lan", Some(argv), &[], clock);
        let clients = source.read_clients().unwrap();
        assert_eq!(clients.len(), 1);
        // 首轮为基线
        assert!(source.poll().unwrap().is_none());
        assert_eq!(source.name(), "lan");
    }

    #[test]
    fn test_oui_lookup() {
        let ouis = parse_oui_table(
            "# comment\n\
             00:1A:2B Acme Cameras\n\
             A4-83-E7   (hex)\t\tApple, Inc.\n\
             3C5AB4 Google\n\
             bogus\n",
        );
        assert_eq!(ouis.len(), 3);
        assert_eq!(oui_prefix("a4:83:e7:01:02:03").as_deref(), Some("A4:83:E7"));
        assert_eq!(lookup_vendor("a4:83:e7:01:02:03", &ouis).as_deref(), Some("Apple, Inc."));
        assert_eq!(lookup_vendor("3c-5a-b4-00-00-01", &ouis).as_deref(), Some("Google"));
        assert_eq!(lookup_vendor("00:1b:00:00:00:01", &ouis), None);
        assert_eq!(lookup_vendor("02:00:00:00:00:01", &ouis).as_deref(), Some(LOCALLY_ADMINISTERED));
        assert_eq!(oui_prefix("zz:zz:zz:00:00:00"), None);
    }

    #[test]
    fn test_parse_arp_table() {
        let hosts = parse_arp_table(
            "KITCHEN-TABLET (192.168.1.20) at aa:bb:cc:00:00:20 [ether] on br0\n\
             ? (192.168.1.21) at aa:bb:cc:00:00:21 [ether] on br0\n\
             printer. (192.168.1.22) at aa:bb:cc:00:00:22 [ether] on br0\n",
        );
        assert_eq!(hosts["192.168.1.20"], "kitchen-tablet");
        assert!(!hosts.contains_key("192.168.1.21"));
        assert_eq!(hosts["192.168.1.22"], "printer.local");
    }

    #[cfg(unix)]
    #[test]
    fn test_new_device_carries_vendor_and_hostname() {
        let clock = Arc::new(ManualClock::new(0.0));
        let dir = tempfile::TempDir::new().unwrap();
        let neigh = dir.path().join("neigh.txt");
        std::fs::write(&neigh, "").unwrap();

        let argv = vec!["cat".to_string(), neigh.display().to_string()];
        let arp = vec![
            "echo".to_string(),
            "camera-1 (10.0.0.9) at 00:1a:2b:00:00:09 [ether] on br0".to_string(),
        ];
        let mut source = LanSource::new("lan", Some(argv), &[], clock)
            .with_oui_table(parse_oui_table("00:1A:2B Acme Cameras\n"))
            .with_arp_command(Some(arp));

        // 1. 空的基线
        assert!(source.poll().unwrap().is_none());

        // 2. 新设备出现
        std::fs::write(&neigh, "10.0.0.9 dev br0 lladdr 00:1A:2B:00:00:09 REACHABLE\n").unwrap();
        let event = match source.poll().unwrap() {
            Some(RawEvent::Normalized(event)) => event,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(event.kind, NEW_DEVICE_KIND);
        assert_eq!(event.details["vendor"], "Acme Cameras");
        assert_eq!(event.details["hostname"], "camera-1");
        assert_eq!(event.details["ip"], "10.0.0.9");
    }
}
