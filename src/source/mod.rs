//! 拉取式事件来源

pub mod doorbell;
pub mod jsonl;

pub use doorbell::DoorbellSource;
pub use jsonl::JsonlFileSource;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{AppConfig, SourceFeed};
use crate::event::{NormalizedEvent, SourceKind};
use crate::presence::{load_oui_table, oui_prefix, LanSource, OuiMap};
use crate::vendor::VendorRegistry;

/// 来源产出的原始事件
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// 未解析的 payload，由引擎按来源类型归一化
    Payload { source: SourceKind, payload: String },
    /// 来源已自行构造好的事件
    Normalized(NormalizedEvent),
}

impl RawEvent {
    pub fn payload(source: SourceKind, payload: impl Into<String>) -> Self {
        RawEvent::Payload {
            source,
            payload: payload.into(),
        }
    }
}

/// 轮询来源：`Ok(None)` 表示暂无事件
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    fn poll(&mut self) -> Result<Option<RawEvent>>;
}

/// 配置好的来源及其轮询间隔
pub struct ConfiguredSource {
    pub source: Box<dyn EventSource>,
    pub interval: Duration,
}

/// 按配置创建所有拉取式来源
///
/// 门铃驱动创建失败只记录并跳过，其余门铃照常运行。会创建 HTTP 客户端，
/// 不要在异步线程上调用。
pub fn build_sources(
    config: &AppConfig,
    registry: &VendorRegistry,
    clock: Arc<dyn Clock>,
) -> Result<Vec<ConfiguredSource>> {
    let mut sources = Vec::new();

    for entry in &config.sources {
        let source: Box<dyn EventSource> = match entry.feed()? {
            SourceFeed::Payload(kind) => {
                let path = entry.path.clone().unwrap_or_default();
                Box::new(
                    JsonlFileSource::new(path, kind)
                        .with_name(entry.display_name())
                        .start_at_end(),
                )
            }
            SourceFeed::LanClients => Box::new(
                LanSource::new(
                    entry.display_name(),
                    entry.command.clone(),
                    &entry.known_macs,
                    clock.clone(),
                )
                .with_oui_table(oui_map(entry.oui_table.as_deref(), &entry.oui)?)
                .with_arp_command(entry.arp_command.clone()),
            ),
        };
        info!(source = %source.name(), kind = %entry.kind, "Configured event source");
        sources.push(ConfiguredSource {
            source,
            interval: entry.poll_interval(),
        });
    }

    for (name, doorbell) in &config.doorbells {
        match registry.create(name, doorbell) {
            Ok(driver) => {
                info!(doorbell = %name, driver = %doorbell.driver, "Configured doorbell");
                sources.push(ConfiguredSource {
                    source: Box::new(DoorbellSource::new(driver, doorbell.debounce_time, clock.clone())),
                    interval: Duration::from_secs_f64(doorbell.poll_interval.max(0.05)),
                });
            }
            Err(e) => error!(doorbell = %name, error = %format!("{:#}", e), "Skipping doorbell"),
        }
    }

    Ok(sources)
}

/// 文件中的 OUI 表加上配置中的条目（后者覆盖前者）
fn oui_map(table: Option<&Path>, inline: &BTreeMap<String, String>) -> Result<OuiMap> {
    let mut ouis = match table {
        Some(path) => load_oui_table(path)?,
        None => OuiMap::new(),
    };
    for (prefix, vendor) in inline {
        match oui_prefix(prefix) {
            Some(prefix) => {
                ouis.insert(prefix, vendor.clone());
            }
            None => warn!(prefix = %prefix, "Ignoring invalid OUI prefix"),
        }
    }
    Ok(ouis)
}
