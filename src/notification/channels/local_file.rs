//! 本地文件渠道 - 将所有通知写入 JSONL 投递记录

use anyhow::Result;
use std::path::PathBuf;
use tracing::debug;

use crate::notification::channel::{Mailer, OutgoingMessage};
use crate::notification::store::{DeliveryRecord, DeliveryStore};

/// 本地文件渠道 - 不真正发信，只记录
pub struct LocalFileMailer {
    store: DeliveryStore,
}

impl LocalFileMailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: DeliveryStore::new(path),
        }
    }

    pub fn store(&self) -> &DeliveryStore {
        &self.store
    }
}

impl Default for LocalFileMailer {
    fn default() -> Self {
        Self::new(DeliveryStore::default_path())
    }
}

impl Mailer for LocalFileMailer {
    fn name(&self) -> &str {
        "local_file"
    }

    fn send(&self, message: &OutgoingMessage) -> Result<bool> {
        let record = DeliveryRecord::from_message(message);
        self.store.append(&record)?;
        debug!(
            channel = "local_file",
            path = %self.store.path().display(),
            event_id = %record.event_id,
            "Notification recorded to local file"
        );
        Ok(true)
    }
}
