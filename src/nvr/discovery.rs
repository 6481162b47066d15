//! 从 NVR 配置中发现摄像头主机
//!
//! 遍历 `cameras.<name>.ffmpeg.inputs[].path`，从第一个能解析出主机的流地址中取出 IP/主机名。

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn host_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:rtsp|rtsps|http|https|rtp)://(?:[^/@]*@)?([\d.]+|[\w.-]+)(?::|/|$)").ok())
        .as_ref()
}

/// 从流地址中取出主机，`0.0.0.0` 视为无效
pub fn extract_host(url: &str) -> Option<String> {
    let caps = host_pattern()?.captures(url)?;
    let host = caps.get(1)?.as_str();
    if host == "0.0.0.0" || host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

/// 摄像头名 -> 主机；没有可用输入的摄像头被跳过
pub fn cameras_from_config(config: &Value) -> BTreeMap<String, String> {
    let Some(cameras) = config.get("cameras").and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    cameras
        .iter()
        .filter_map(|(name, camera)| {
            let inputs = camera
                .get("ffmpeg")
                .and_then(|f| f.get("inputs"))
                .and_then(Value::as_array)?;
            let host = inputs
                .iter()
                .filter_map(|input| input.get("path").and_then(Value::as_str))
                .find_map(extract_host);
            match host {
                Some(host) => Some((name.clone(), host)),
                None => {
                    tracing::debug!(camera = %name, "No usable stream address for camera");
                    None
                }
            }
        })
        .collect()
}
