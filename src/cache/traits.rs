//! Core traits and types for the cache store.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::collections::BTreeSet;
use std::fmt;

use crate::http::{CacheKey, Headers, Response, ResponseType};

/// A named, versioned partition of the cache store (e.g. "static-v3").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheNamespace {
  pub name: String,
  pub version: u32,
}

impl CacheNamespace {
  pub fn new(name: impl Into<String>, version: u32) -> Self {
    Self {
      name: name.into(),
      version,
    }
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-v{}", self.name, self.version)
  }
}

/// A stored response plus the metadata needed to serve it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub url: Option<url::Url>,
  pub kind: ResponseType,
  /// When the entry was written; refreshed on every overwrite
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Snapshot a response for storage.
  pub fn from_response(key: CacheKey, response: &Response) -> Self {
    Self {
      key,
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      url: response.url.clone(),
      kind: response.kind,
      stored_at: Utc::now(),
    }
  }

  /// Rebuild the response exactly as it was stored.
  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      url: self.url.clone(),
      kind: self.kind,
    }
  }

  pub fn age(&self) -> Duration {
    Utc::now() - self.stored_at
  }
}

/// Trait for cache store backends.
///
/// Reads of a missing key, or of a key in a deleted namespace, return `None`.
/// Each `put` is atomic; concurrent puts to one key are last-write-wins.
pub trait CacheStore: Send + Sync + 'static {
  /// Get a single entry.
  fn get(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, creating the namespace if needed.
  fn put(&self, namespace: &CacheNamespace, entry: &CacheEntry) -> Result<()>;

  /// Store a batch of entries. Either every entry is written or none is,
  /// and entries that existed before a failed batch are left untouched.
  fn put_all(&self, namespace: &CacheNamespace, entries: &[CacheEntry]) -> Result<()>;

  /// Remove a single entry. Returns whether it existed.
  fn delete(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<bool>;

  /// Create an empty namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()>;

  /// Drop a namespace and every entry in it. Returns whether it existed.
  fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool>;

  /// All namespaces currently present.
  fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>>;

  /// Keys stored in a namespace.
  fn keys(&self, namespace: &CacheNamespace) -> Result<Vec<CacheKey>>;
}
