//! Cache layer that sits between the strategies and the storage backend.

use chrono::{Duration, Utc};
use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::warn;

use super::traits::{CacheEntry, CacheNamespace, CacheStore};
use crate::http::CacheKey;

type Slot = (CacheNamespace, CacheKey);

/// Handle to a cache write running in the background.
///
/// Resolves to `true` once the entry is committed, `false` if the store
/// rejected it. Cloning is cheap; every clone observes the same write.
#[derive(Clone)]
pub struct PendingWrite(Shared<BoxFuture<'static, bool>>);

impl std::fmt::Debug for PendingWrite {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("PendingWrite")
      .field(&self.0.peek().copied())
      .finish()
  }
}

impl PendingWrite {
  pub async fn wait(self) -> bool {
    self.0.await
  }
}

/// Cache layer that manages storage access and write ordering.
///
/// Writes started with [`CacheLayer::put_detached`] return immediately; a
/// later `get` of the same key waits for them, so a reader never sees an
/// older entry than the one being stored.
pub struct CacheLayer<S: CacheStore> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
  pending: Arc<Mutex<HashMap<Slot, (u64, PendingWrite)>>>,
  next_write: Arc<AtomicU64>,
}

impl<S: CacheStore> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  /// Create a cache layer over a store that is shared with other layers.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      stale_time: Duration::minutes(5),
      pending: Arc::new(Mutex::new(HashMap::new())),
      next_write: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Check if a cached entry is older than the stale time.
  ///
  /// Informational only: stale entries are still served as fallbacks.
  pub fn is_stale(&self, entry: &CacheEntry) -> bool {
    Utc::now() - entry.stored_at > self.stale_time
  }

  /// Look up an entry. Store failures are logged and read as a miss.
  pub async fn get(&self, namespace: &CacheNamespace, key: &CacheKey) -> Option<CacheEntry> {
    if let Some(write) = self.pending_write(namespace, key) {
      write.wait().await;
    }

    let storage = Arc::clone(&self.storage);
    let (ns, k) = (namespace.clone(), key.clone());
    match tokio::task::spawn_blocking(move || storage.get(&ns, &k)).await {
      Ok(Ok(entry)) => entry,
      Ok(Err(e)) => {
        warn!(namespace = %namespace, key = %key, error = %e, "cache read failed");
        None
      }
      Err(e) => {
        warn!(namespace = %namespace, key = %key, error = %e, "cache read task failed");
        None
      }
    }
  }

  /// Store an entry and wait for the commit. Failures are returned.
  pub async fn put(&self, namespace: &CacheNamespace, entry: CacheEntry) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = namespace.clone();
    tokio::task::spawn_blocking(move || storage.put(&namespace, &entry))
      .await
      .map_err(|e| color_eyre::eyre::eyre!("Cache write task failed: {}", e))?
  }

  /// Store a batch atomically and wait for the commit.
  pub async fn put_all(&self, namespace: &CacheNamespace, entries: Vec<CacheEntry>) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = namespace.clone();
    tokio::task::spawn_blocking(move || storage.put_all(&namespace, &entries))
      .await
      .map_err(|e| color_eyre::eyre::eyre!("Cache write task failed: {}", e))?
  }

  /// Start storing an entry without waiting for it.
  ///
  /// The write runs to completion even if the handle is dropped. Failures
  /// are logged; caching is best effort.
  pub fn put_detached(&self, namespace: &CacheNamespace, entry: CacheEntry) -> PendingWrite {
    let id = self.next_write.fetch_add(1, Ordering::Relaxed);
    let slot: Slot = (namespace.clone(), entry.key.clone());
    let (tx, rx) = oneshot::channel();
    let write = PendingWrite(rx.map(|r| r.unwrap_or(false)).boxed().shared());

    match self.pending.lock() {
      Ok(mut pending) => {
        pending.insert(slot.clone(), (id, write.clone()));
      }
      Err(e) => warn!(error = %e, "pending write registry poisoned"),
    }

    let storage = Arc::clone(&self.storage);
    let pending = Arc::clone(&self.pending);
    tokio::task::spawn_blocking(move || {
      let (namespace, key) = &slot;
      let committed = match storage.put(namespace, &entry) {
        Ok(()) => true,
        Err(e) => {
          warn!(namespace = %namespace, key = %key, error = %e, "cache write failed");
          false
        }
      };

      // Only clear the slot if a newer write has not replaced it
      if let Ok(mut pending) = pending.lock() {
        if pending.get(&slot).map(|(current, _)| *current) == Some(id) {
          pending.remove(&slot);
        }
      }

      let _ = tx.send(committed);
    });

    write
  }

  fn pending_write(&self, namespace: &CacheNamespace, key: &CacheKey) -> Option<PendingWrite> {
    let pending = self.pending.lock().ok()?;
    pending
      .get(&(namespace.clone(), key.clone()))
      .map(|(_, write)| write.clone())
  }

  pub fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()> {
    self.storage.open_namespace(namespace)
  }

  pub fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool> {
    self.storage.delete_namespace(namespace)
  }

  pub fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>> {
    self.storage.list_namespaces()
  }

  pub fn keys(&self, namespace: &CacheNamespace) -> Result<Vec<CacheKey>> {
    self.storage.keys(namespace)
  }
}

impl<S: CacheStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
      pending: Arc::clone(&self.pending),
      next_write: Arc::clone(&self.next_write),
    }
  }
}
