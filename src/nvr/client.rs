//! NVR HTTP 客户端
//!
//! - 配置了 auth_url + 用户名密码时，先 POST `/api/login` 取得 token
//!   （从 `Set-Cookie: frigate_token=...` 中解析），缓存 8 小时
//! - 请求带 `Authorization: Bearer <token>`，401 时重新登录并重试一次
//! - 图片获取失败只记录日志，邮件照常发送

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::SET_COOKIE;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::NvrConfig;
use crate::error::NotifyError;
use crate::notification::channel::{ImageFetcher, ImageKind};

use super::discovery::cameras_from_config;

const TOKEN_COOKIE: &str = "frigate_token";
const TOKEN_LIFETIME: Duration = Duration::from_secs(8 * 60 * 60);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const MIN_TOKEN_LEN: usize = 10;

struct CachedToken {
    value: String,
    obtained_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.obtained_at.elapsed() + TOKEN_REFRESH_MARGIN < TOKEN_LIFETIME
    }
}

/// NVR 客户端
pub struct NvrClient {
    client: Client,
    config: NvrConfig,
    token: Mutex<Option<CachedToken>>,
}

impl NvrClient {
    pub fn new(config: NvrConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| anyhow!("Cannot create HTTP client: {}", e))?;
        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NvrConfig {
        &self.config
    }

    pub fn api_url(&self) -> String {
        self.config.api_url()
    }

    pub fn image_url(&self, event_id: &str, kind: ImageKind) -> String {
        format!("{}/api/events/{}/{}.jpg", self.api_url(), event_id, kind.as_str())
    }

    /// 登录并缓存 token
    pub fn login(&self) -> Result<String> {
        let (auth_url, user, password) = match (
            &self.config.auth_url,
            &self.config.username,
            &self.config.password,
        ) {
            (Some(url), Some(user), Some(password)) => (url, user, password),
            _ => return Err(NotifyError::Auth("no NVR credentials configured".into()).into()),
        };

        let url = format!("{}/api/login", auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %user, "Logging in to NVR");
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "user": user, "password": password }))
            .send()
            .with_context(|| format!("NVR login request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Auth(format!("NVR login rejected ({})", status)).into());
        }

        let token = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .find_map(parse_token_cookie)
            .ok_or_else(|| NotifyError::Auth("NVR login returned no usable token".into()))?;

        info!(url = %auth_url, "NVR login succeeded");
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(CachedToken {
            value: token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(token)
    }

    /// 当前可用 token：静态 token 优先，其次缓存，过期则重新登录
    fn bearer(&self) -> Result<Option<String>> {
        if let Some(token) = &self.config.token {
            return Ok(Some(token.clone()));
        }
        if !self.config.needs_auth() {
            return Ok(None);
        }
        {
            let cached = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(Some(token.value.clone()));
            }
        }
        self.login().map(Some)
    }

    fn invalidate_token(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn send_get(&self, url: &str, token: Option<&str>) -> Result<Response> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .with_context(|| format!("GET {} failed", url))
    }

    /// 带认证的 GET，401 时重新登录后重试一次
    pub fn get(&self, url: &str) -> Result<Response> {
        let token = self.bearer()?;
        let response = self.send_get(url, token.as_deref())?;
        if response.status() != StatusCode::UNAUTHORIZED || !self.config.needs_auth() {
            return Ok(response);
        }

        warn!(url = %url, "NVR returned 401, logging in again");
        self.invalidate_token();
        let token = self.login()?;
        self.send_get(url, Some(&token))
    }

    /// 下载事件图片
    pub fn fetch_image(&self, event_id: &str, kind: ImageKind) -> Result<Vec<u8>> {
        let url = self.image_url(event_id, kind);
        let response = self.get(&url)?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned {}", url, status));
        }
        let bytes = response.bytes().context("Failed to read image body")?;
        if bytes.is_empty() {
            return Err(anyhow!("{} returned an empty image", url));
        }
        debug!(event_id = %event_id, kind = %kind, size = bytes.len(), "Fetched event image");
        Ok(bytes.to_vec())
    }

    /// 读取 NVR 完整配置
    pub fn fetch_config(&self) -> Result<Value> {
        let url = format!("{}/api/config", self.api_url());
        let response = self.get(&url)?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned {}", url, status));
        }
        response
            .json::<Value>()
            .with_context(|| format!("{} returned invalid JSON", url))
    }

    /// 摄像头名 -> 主机
    pub fn discover_cameras(&self) -> Result<BTreeMap<String, String>> {
        let config = self.fetch_config()?;
        let cameras = cameras_from_config(&config);
        info!(count = cameras.len(), "Discovered cameras from NVR config");
        Ok(cameras)
    }
}

impl ImageFetcher for NvrClient {
    fn fetch(&self, event_id: &str, kind: ImageKind) -> Option<Vec<u8>> {
        match self.fetch_image(event_id, kind) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(event_id = %event_id, kind = %kind, error = %e, "Failed to fetch event image");
                None
            }
        }
    }
}

/// 从单个 Set-Cookie 头中取出 token
pub fn parse_token_cookie(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(name, _)| name.trim() == TOKEN_COOKIE)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
}
