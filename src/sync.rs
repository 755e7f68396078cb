//! Replays the deferred write queue when a sync opportunity arrives.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::http::Request;
use crate::network::Network;
use crate::notify::{NotificationDispatcher, NotificationIntent};
use crate::queue::{DeferredWriteItem, WriteQueue};

/// Outcome of one replay pass, ids in enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub delivered: Vec<String>,
  pub failed: Vec<String>,
}

/// Owns the deferred write queue and its replay.
pub struct SyncCoordinator {
  config: Arc<ControllerConfig>,
  queue: Arc<dyn WriteQueue>,
  network: Arc<dyn Network>,
  notifications: Arc<NotificationDispatcher>,
  /// Serializes replay passes so an item is never delivered twice concurrently
  replaying: Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    config: Arc<ControllerConfig>,
    queue: Arc<dyn WriteQueue>,
    network: Arc<dyn Network>,
    notifications: Arc<NotificationDispatcher>,
  ) -> Self {
    Self {
      config,
      queue,
      network,
      notifications,
      replaying: Mutex::new(()),
    }
  }

  /// Queue a write for later replay. Committed before this returns.
  pub fn enqueue(&self, item: DeferredWriteItem) -> Result<DeferredWriteItem> {
    self.queue.enqueue(&item)?;
    info!(id = %item.id, endpoint = %item.endpoint, "deferred write queued");
    Ok(item)
  }

  pub fn pending(&self) -> Result<Vec<DeferredWriteItem>> {
    self.queue.pending()
  }

  /// Handle a sync trigger. Tags other than the configured one are ignored.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    if tag != self.config.sync_tag {
      debug!(tag, "ignoring unknown sync tag");
      return Ok(None);
    }
    self.replay().await.map(Some)
  }

  /// Attempt every queued item once, sequentially, in enqueue order.
  ///
  /// Delivered items are removed and announced; failed items stay queued
  /// for the next trigger with their attempt count bumped.
  pub async fn replay(&self) -> Result<SyncReport> {
    let _guard = self.replaying.lock().await;
    let mut report = SyncReport::default();

    for item in self.queue.pending()? {
      if self.deliver(&item).await {
        self.queue.remove(&item.id)?;
        self.announce(&item).await;
        report.delivered.push(item.id);
      } else {
        self.queue.record_attempt(&item.id)?;
        report.failed.push(item.id);
      }
    }

    info!(
      delivered = report.delivered.len(),
      failed = report.failed.len(),
      "deferred write replay finished"
    );
    Ok(report)
  }

  async fn deliver(&self, item: &DeferredWriteItem) -> bool {
    let request = match self
      .config
      .resolve(&item.endpoint)
      .and_then(|url| Request::json(item.method, url, &item.payload))
    {
      Ok(r) => r,
      Err(e) => {
        warn!(id = %item.id, error = %e, "cannot build replay request");
        return false;
      }
    };

    match self.network.fetch(&request).await {
      Ok(response) if response.ok() => true,
      Ok(response) => {
        debug!(id = %item.id, status = response.status, "replay rejected");
        false
      }
      Err(e) => {
        debug!(id = %item.id, error = %e, "replay failed");
        false
      }
    }
  }

  async fn announce(&self, item: &DeferredWriteItem) {
    let defaults = &self.config.notifications;
    let intent = NotificationIntent {
      title: "Sync complete".to_string(),
      body: "Changes made while offline have been saved.".to_string(),
      icon: defaults.icon.clone(),
      tag: format!("sync-{}", item.id),
      target_url: defaults.url.clone(),
    };
    if let Err(e) = self.notifications.show(&intent).await {
      warn!(id = %item.id, error = %e, "failed to show sync notification");
    }
  }
}
