//! Persistent queue of writes that could not reach the network.

mod storage;

pub use storage::{MemoryQueue, SqliteQueue};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::http::Method;

/// A queued write awaiting replay. Owned by the queue; removed once delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredWriteItem {
  pub id: String,
  pub method: Method,
  pub endpoint: String,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
}

impl DeferredWriteItem {
  /// New item with a fresh v4 id.
  pub fn new(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      method: Method::Post,
      endpoint: endpoint.into(),
      payload,
      enqueued_at: Utc::now(),
      attempts: 0,
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }
}

/// Trait for deferred write queue backends.
///
/// `pending` returns items in enqueue order.
pub trait WriteQueue: Send + Sync + 'static {
  fn enqueue(&self, item: &DeferredWriteItem) -> Result<()>;

  fn pending(&self) -> Result<Vec<DeferredWriteItem>>;

  /// Remove a delivered item. Returns whether it was present.
  fn remove(&self, id: &str) -> Result<bool>;

  /// Count a failed delivery attempt.
  fn record_attempt(&self, id: &str) -> Result<()>;

  fn len(&self) -> Result<usize>;

  fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}
