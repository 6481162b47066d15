//! 配置加载
//!
//! YAML 配置文件，加载流程：
//! 1. 读取文件并展开 `${VAR}` / `$VAR` 环境变量（未定义的保持原样）
//! 2. serde_yaml 反序列化
//! 3. 校验：规则编译、exceptions 取值
//!
//! 任何错误都以 `NotifyError::Config` / `Yaml` / `Io` 返回，启动前失败。

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connectivity::ExceptionState;
use crate::error::{NotifyError, Result};
use crate::rules::{RuleDefinition, RuleSet};

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "event-notifier.yml";

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// NVR 服务器
    #[serde(default, alias = "nvr")]
    pub frigate: NvrConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default, alias = "connectivity_checker")]
    pub connectivity: ConnectivityConfig,

    /// 拉取式事件来源
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// 门铃：名称 -> 配置
    #[serde(default)]
    pub doorbells: BTreeMap<String, DoorbellConfig>,

    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// 从 YAML 文件加载并校验
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            rules = config.notifications.rules.len(),
            sources = config.sources.len(),
            doorbells = config.doorbells.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// 从 YAML 字符串加载并校验
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// 默认配置路径：当前目录下的文件优先，其次 `<config_dir>/event-notifier/`
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|d| d.join("event-notifier").join(DEFAULT_CONFIG_FILE))
            .unwrap_or(local)
    }

    pub fn validate(&self) -> Result<()> {
        self.rule_set()?;
        self.exceptions()?;
        check_seconds("connectivity.timeout_secs", self.connectivity.timeout_secs, false)?;
        for source in &self.sources {
            source.feed()?;
            check_seconds(
                &format!("sources.{}.poll_interval_secs", source.display_name()),
                source.poll_interval_secs,
                false,
            )?;
            if let Some(path) = &source.oui_table {
                if !path.is_file() {
                    return Err(NotifyError::Config(format!(
                        "source '{}': OUI table {} not found",
                        source.display_name(),
                        path.display()
                    )));
                }
            }
        }
        for (name, doorbell) in &self.doorbells {
            check_seconds(&format!("doorbells.{}.poll_interval", name), doorbell.poll_interval, false)?;
            check_seconds(&format!("doorbells.{}.debounce_time", name), doorbell.debounce_time, true)?;
        }
        Ok(())
    }

    /// 合并 defaults 并编译规则
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::load(&self.notifications.defaults, &self.notifications.rules)
    }

    /// 解析连通性例外
    pub fn exceptions(&self) -> Result<BTreeMap<String, ExceptionState>> {
        self.connectivity
            .exceptions
            .iter()
            .map(|(name, state)| {
                state
                    .parse::<ExceptionState>()
                    .map(|s| (name.clone(), s))
                    .map_err(|_| {
                        NotifyError::Config(format!(
                            "connectivity exception '{}' has invalid state '{}' (expected enabled/disabled)",
                            name, state
                        ))
                    })
            })
            .collect()
    }
}

/// 发信配置（通过本机 sendmail）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// 秒
    #[serde(default = "default_smtp_timeout", alias = "timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            sendmail_path: default_sendmail_path(),
            from_address: String::new(),
            from_name: default_from_name(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

/// NVR 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvrConfig {
    /// 需要认证的地址（配置了用户名密码时优先使用）
    #[serde(default)]
    pub auth_url: Option<String>,
    /// 免认证地址
    #[serde(default = "default_unauth_url", alias = "api_url")]
    pub unauth_url: String,
    /// 邮件中链接使用的外部地址
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 固定的 bearer token（与用户名密码二选一）
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl NvrConfig {
    pub fn needs_auth(&self) -> bool {
        self.auth_url.is_some() && self.username.is_some() && self.password.is_some()
    }

    /// API 地址：配置了认证时用 auth_url，否则用 unauth_url
    pub fn api_url(&self) -> String {
        let url = match &self.auth_url {
            Some(auth) if self.needs_auth() => auth.as_str(),
            _ => self.unauth_url.as_str(),
        };
        url.trim_end_matches('/').to_string()
    }

    /// 外部地址，缺省时退化为 API 地址
    pub fn external_url(&self) -> String {
        self.external_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.api_url())
    }
}

impl Default for NvrConfig {
    fn default() -> Self {
        Self {
            auth_url: None,
            unauth_url: default_unauth_url(),
            external_url: None,
            username: None,
            password: None,
            token: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

/// 通知规则配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub defaults: RuleDefinition,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// 探测方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Tcp,
    Netcat,
}

/// 摄像头连通性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// 摄像头名 -> enabled/disabled
    #[serde(default)]
    pub exceptions: BTreeMap<String, String>,
    #[serde(default = "default_probe_port")]
    pub port: u16,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub probe: ProbeKind,
    /// 设备控制命令模板，支持 `{device}` 和 `{state}`（ON/OFF）
    #[serde(default)]
    pub device_command: Option<Vec<String>>,
    /// 静态设备列表：名称 -> 主机，与 NVR 发现结果合并
    #[serde(default)]
    pub devices: BTreeMap<String, String>,
    /// 是否从 NVR 配置中发现摄像头
    #[serde(default = "default_true")]
    pub discover: bool,
}

impl ConnectivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.001))
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            exceptions: BTreeMap::new(),
            port: default_probe_port(),
            timeout_secs: default_probe_timeout(),
            probe: ProbeKind::default(),
            device_command: None,
            devices: BTreeMap::new(),
            discover: default_true(),
        }
    }
}

/// 来源的数据格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFeed {
    /// 每行一个原始 payload
    Payload(crate::event::SourceKind),
    /// 邻居表命令输出
    LanClients,
}

/// 拉取式来源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// message_bus / camera_api / hub_webhook / lan_clients
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// JSONL 文件路径（payload 来源）
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// 邻居表命令（lan_clients 来源），默认 `ip neigh`
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// 已知设备："<mac> <别名>"
    #[serde(default)]
    pub known_macs: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// 主机名命令（lan_clients 来源，`arp -a` 格式），不设置则不解析主机名
    #[serde(default)]
    pub arp_command: Option<Vec<String>>,
    /// OUI 厂商表文件（每行 `<前缀> <厂商>`）
    #[serde(default)]
    pub oui_table: Option<PathBuf>,
    /// 直接写在配置里的 OUI 条目，优先于文件
    #[serde(default)]
    pub oui: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn feed(&self) -> Result<SourceFeed> {
        let kind = self.kind.trim().to_ascii_lowercase();
        if kind == "lan_clients" || kind == "lan" {
            return Ok(SourceFeed::LanClients);
        }
        let source = kind.parse()?;
        if self.path.is_none() {
            return Err(NotifyError::Config(format!(
                "source '{}' of kind {} needs a path",
                self.display_name(),
                kind
            )));
        }
        Ok(SourceFeed::Payload(source))
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.path.as_ref().map(|p| p.display().to_string()))
            .unwrap_or_else(|| self.kind.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(0.05))
    }
}

/// 门铃配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorbellConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub ip: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_debounce")]
    pub debounce_time: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// 投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    #[default]
    Sendmail,
    LocalFile,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Sendmail => "sendmail",
            DeliveryMethod::LocalFile => "local_file",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub method: DeliveryMethod,
    /// 投递记录路径，默认 `<config_dir>/event-notifier/deliveries.jsonl`
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

fn default_sendmail_path() -> String {
    "/usr/sbin/sendmail".to_string()
}

fn default_from_name() -> String {
    "Event Notifier".to_string()
}

fn default_smtp_timeout() -> u64 {
    30
}

fn default_unauth_url() -> String {
    "http://frigate:5000".to_string()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_probe_port() -> u16 {
    554
}

fn default_probe_timeout() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_source_kind() -> String {
    "message_bus".to_string()
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_driver() -> String {
    "reolink".to_string()
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_debounce() -> f64 {
    5.0
}

/// 秒数上限，超过则视为配置错误
const MAX_SECONDS: f64 = 86_400.0;

/// 秒数必须是有限值且不超过一天；`allow_zero` 为 false 时必须为正
fn check_seconds(field: &str, value: f64, allow_zero: bool) -> Result<()> {
    let in_range = value.is_finite()
        && value <= MAX_SECONDS
        && if allow_zero { value >= 0.0 } else { value > 0.0 };
    if in_range {
        Ok(())
    } else {
        Err(NotifyError::Config(format!(
            "{} must be {} and at most {} seconds, got {}",
            field,
            if allow_zero { "non-negative" } else { "positive" },
            MAX_SECONDS,
            value
        )))
    }
}

/// 展开 `${VAR}` 和 `$VAR`，未定义的变量保持原样
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    pattern
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
