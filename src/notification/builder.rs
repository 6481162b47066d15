//! 通知系统构建器 - 根据配置组装 dispatcher

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::channel::{ImageFetcher, Mailer, NoImages};
use super::channels::local_file::LocalFileMailer;
use super::channels::sendmail::{SendmailConfig, SendmailMailer};
use super::dispatcher::NotificationDispatcher;
use super::formatter::MessageFormatter;
use super::store::DeliveryStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, DeliveryMethod};
use crate::nvr::NvrClient;

/// 通知系统构建器
pub struct DispatcherBuilder<'a> {
    config: &'a AppConfig,
    clock: Arc<dyn Clock>,
    dry_run: bool,
    fetch_images: bool,
    mailer: Option<Arc<dyn Mailer>>,
}

impl<'a> DispatcherBuilder<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            dry_run: false,
            fetch_images: true,
            mailer: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 设置 dry-run 模式
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 是否从 NVR 下载图片
    pub fn fetch_images(mut self, fetch: bool) -> Self {
        self.fetch_images = fetch;
        self
    }

    /// 覆盖配置中的投递方式
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn build(self) -> Result<NotificationDispatcher> {
        let mailer = match self.mailer.clone() {
            Some(mailer) => mailer,
            None => self.build_mailer(),
        };

        let images: Arc<dyn ImageFetcher> = if self.fetch_images {
            Arc::new(NvrClient::new(self.config.frigate.clone())?)
        } else {
            Arc::new(NoImages)
        };

        let formatter =
            MessageFormatter::new().with_external_url(Some(self.config.frigate.external_url()));

        info!(
            mailer = %mailer.name(),
            nvr = %self.config.frigate.api_url(),
            images = self.fetch_images,
            dry_run = self.dry_run,
            "Notification dispatcher ready"
        );

        Ok(NotificationDispatcher::new(mailer, self.clock)
            .with_image_fetcher(images)
            .with_formatter(formatter)
            .with_dry_run(self.dry_run))
    }

    fn build_mailer(&self) -> Arc<dyn Mailer> {
        match self.config.delivery.method {
            DeliveryMethod::Sendmail => {
                let smtp = &self.config.smtp;
                Arc::new(SendmailMailer::new(SendmailConfig {
                    sendmail_path: smtp.sendmail_path.clone(),
                    from_address: smtp.from_address.clone(),
                    from_name: smtp.from_name.clone(),
                    timeout: Duration::from_secs(smtp.timeout_secs.max(1)),
                }))
            }
            DeliveryMethod::LocalFile => {
                let path = self
                    .config
                    .delivery
                    .log_path
                    .clone()
                    .unwrap_or_else(DeliveryStore::default_path);
                Arc::new(LocalFileMailer::new(path))
            }
        }
    }
}
