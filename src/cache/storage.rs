//! Cache store backends: SQLite for persistence, memory for tests and ephemeral runs.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use super::traits::{CacheEntry, CacheNamespace, CacheStore};
use crate::db::SharedConnection;
use crate::http::{CacheKey, Headers, ResponseType};

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: SharedConnection,
}

impl SqliteStore {
  pub fn new(conn: SharedConnection) -> Self {
    Self { conn }
  }
}

/// Fixed-length row key for a cache key.
fn key_hash(key: &CacheKey) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp: {}", ms))
}

fn upsert_entry(conn: &Connection, namespace: &CacheNamespace, entry: &CacheEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (namespace, version) VALUES (?, ?)",
      params![namespace.name, namespace.version],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

  // Single upsert keeps the write atomic; stored_at never moves backwards
  conn
    .execute(
      "INSERT INTO cache_entries (namespace, version, key_hash, key, status, headers, body, url, kind, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT (namespace, version, key_hash) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         url = excluded.url,
         kind = excluded.kind,
         stored_at = MAX(cache_entries.stored_at, excluded.stored_at)",
      params![
        namespace.name,
        namespace.version,
        key_hash(&entry.key),
        entry.key.as_str(),
        entry.status,
        headers,
        entry.body,
        entry.url.as_ref().map(|u| u.as_str()),
        entry.kind.as_str(),
        entry.stored_at.timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

  Ok(())
}

impl CacheStore for SqliteStore {
  fn get(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    type Row = (String, u16, String, Vec<u8>, Option<String>, String, i64);
    let row: Option<Row> = conn
      .query_row(
        "SELECT key, status, headers, body, url, kind, stored_at FROM cache_entries
         WHERE namespace = ? AND version = ? AND key_hash = ?",
        params![namespace.name, namespace.version, key_hash(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((raw_key, status, headers, body, url, kind, stored_at)) = row else {
      return Ok(None);
    };

    let headers: Headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    let url = url
      .map(|u| url::Url::parse(&u))
      .transpose()
      .map_err(|e| eyre!("Failed to parse stored URL: {}", e))?;

    Ok(Some(CacheEntry {
      key: CacheKey::from_stored(raw_key),
      status,
      headers,
      body,
      url,
      kind: ResponseType::parse(&kind),
      stored_at: millis_to_datetime(stored_at)?,
    }))
  }

  fn put(&self, namespace: &CacheNamespace, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    upsert_entry(&conn, namespace, entry)
  }

  fn put_all(&self, namespace: &CacheNamespace, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction on error rolls every write back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    for entry in entries {
      upsert_entry(&tx, namespace, entry)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND version = ? AND key_hash = ?",
        params![namespace.name, namespace.version, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (namespace, version) VALUES (?, ?)",
        params![namespace.name, namespace.version],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;

    Ok(())
  }

  fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ? AND version = ?",
      params![namespace.name, namespace.version],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE namespace = ? AND version = ?",
        params![namespace.name, namespace.version],
      )
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT namespace, version FROM cache_namespaces")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let namespaces = stmt
      .query_map([], |row| Ok(CacheNamespace::new(row.get::<_, String>(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<_>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(namespaces)
  }

  fn keys(&self, namespace: &CacheNamespace) -> Result<Vec<CacheKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM cache_entries WHERE namespace = ? AND version = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace.name, namespace.version], |row| {
        row.get::<_, String>(0).map(CacheKey::from_stored)
      })
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }
}

fn insert_entry(ns: &mut HashMap<CacheKey, CacheEntry>, entry: &CacheEntry) {
  let mut entry = entry.clone();
  if let Some(previous) = ns.get(&entry.key) {
    entry.stored_at = entry.stored_at.max(previous.stored_at);
  }
  ns.insert(entry.key.clone(), entry);
}

/// In-memory cache store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
  namespaces: RwLock<HashMap<CacheNamespace, HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn get(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let namespaces = self
      .namespaces
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
  }

  fn put(&self, namespace: &CacheNamespace, entry: &CacheEntry) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let ns = namespaces.entry(namespace.clone()).or_default();
    insert_entry(ns, entry);
    Ok(())
  }

  fn put_all(&self, namespace: &CacheNamespace, entries: &[CacheEntry]) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let ns = namespaces.entry(namespace.clone()).or_default();
    for entry in entries {
      insert_entry(ns, entry);
    }
    Ok(())
  }

  fn delete(&self, namespace: &CacheNamespace, key: &CacheKey) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .get_mut(namespace)
        .and_then(|ns| ns.remove(key))
        .is_some(),
    )
  }

  fn open_namespace(&self, namespace: &CacheNamespace) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    namespaces.entry(namespace.clone()).or_default();
    Ok(())
  }

  fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.remove(namespace).is_some())
  }

  fn list_namespaces(&self) -> Result<BTreeSet<CacheNamespace>> {
    let namespaces = self
      .namespaces
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.keys().cloned().collect())
  }

  fn keys(&self, namespace: &CacheNamespace) -> Result<Vec<CacheKey>> {
    let namespaces = self
      .namespaces
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut keys: Vec<CacheKey> = namespaces
      .get(namespace)
      .map(|ns| ns.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::{Method, Response};
  use chrono::Duration;
  use std::sync::Arc;

  fn entry(url: &str, body: &str) -> CacheEntry {
    let url = url::Url::parse(url).unwrap();
    let key = CacheKey::derive(Method::Get, &url);
    let response = Response::new(200, body)
      .with_url(url)
      .with_kind(ResponseType::Basic)
      .with_header("content-type", "text/plain");
    CacheEntry::from_response(key, &response)
  }

  fn stores() -> Vec<Box<dyn CacheStore>> {
    let db = Database::open_in_memory().unwrap();
    vec![
      Box::new(SqliteStore::new(db.shared())),
      Box::new(MemoryStore::new()),
    ]
  }

  #[test]
  fn test_missing_key_is_absent_not_error() {
    for store in stores() {
      let ns = CacheNamespace::new("api", 1);
      let e = entry("https://a.test/x", "x");
      assert!(store.get(&ns, &e.key).unwrap().is_none());
    }
  }

  #[test]
  fn test_put_then_get_roundtrips_response() {
    for store in stores() {
      let ns = CacheNamespace::new("static", 1);
      let e = entry("https://a.test/app.js", "console.log(1)");
      store.put(&ns, &e).unwrap();

      let got = store.get(&ns, &e.key).unwrap().unwrap();
      assert_eq!(got.to_response(), e.to_response());
      assert_eq!(got.stored_at.timestamp_millis(), e.stored_at.timestamp_millis());
    }
  }

  #[test]
  fn test_overwrite_is_last_write_wins_with_monotonic_timestamp() {
    for store in stores() {
      let ns = CacheNamespace::new("api", 1);
      let first = entry("https://a.test/api/products", "one");
      store.put(&ns, &first).unwrap();

      let mut second = entry("https://a.test/api/products", "two");
      second.stored_at = first.stored_at - Duration::seconds(30);
      store.put(&ns, &second).unwrap();

      let got = store.get(&ns, &first.key).unwrap().unwrap();
      assert_eq!(got.body, b"two");
      assert!(got.stored_at >= first.stored_at - Duration::milliseconds(1));
    }
  }

  #[test]
  fn test_namespaces_are_isolated_by_version() {
    for store in stores() {
      let v1 = CacheNamespace::new("api", 1);
      let v2 = CacheNamespace::new("api", 2);
      let e = entry("https://a.test/api/x", "x");
      store.put(&v1, &e).unwrap();

      assert!(store.get(&v2, &e.key).unwrap().is_none());
    }
  }

  #[test]
  fn test_deleted_namespace_reads_absent() {
    for store in stores() {
      let ns = CacheNamespace::new("images", 3);
      let e = entry("https://a.test/logo.png", "png");
      store.put(&ns, &e).unwrap();

      assert!(store.delete_namespace(&ns).unwrap());
      assert!(store.get(&ns, &e.key).unwrap().is_none());
      assert!(!store.list_namespaces().unwrap().contains(&ns));
      assert!(!store.delete_namespace(&ns).unwrap());
    }
  }

  #[test]
  fn test_open_namespace_lists_empty_namespace() {
    for store in stores() {
      let ns = CacheNamespace::new("static", 4);
      store.open_namespace(&ns).unwrap();
      store.open_namespace(&ns).unwrap();

      assert_eq!(store.list_namespaces().unwrap().len(), 1);
      assert!(store.keys(&ns).unwrap().is_empty());
    }
  }

  #[test]
  fn test_delete_single_entry() {
    for store in stores() {
      let ns = CacheNamespace::new("static", 1);
      let e = entry("https://a.test/a.css", "body{}");
      store.put(&ns, &e).unwrap();

      assert!(store.delete(&ns, &e.key).unwrap());
      assert!(!store.delete(&ns, &e.key).unwrap());
      assert!(store.keys(&ns).unwrap().is_empty());
    }
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    for store in stores() {
      let ns = CacheNamespace::new("static", 1);
      let batch = [entry("https://a.test/a.css", "a"), entry("https://a.test/b.js", "b")];
      store.put_all(&ns, &batch).unwrap();

      assert_eq!(store.keys(&ns).unwrap().len(), 2);
    }
  }

  #[test]
  fn test_failed_put_all_keeps_previous_entries() {
    let db = Database::open_in_memory().unwrap();
    let store = SqliteStore::new(db.shared());
    let ns = CacheNamespace::new("static", 1);
    let page = entry("https://a.test/offline.html", "old page");
    store.put(&ns, &page).unwrap();

    db.shared()
      .lock()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_css BEFORE INSERT ON cache_entries
         WHEN NEW.key LIKE '%/new.css'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
      )
      .unwrap();

    let batch = [
      entry("https://a.test/offline.html", "new page"),
      entry("https://a.test/new.css", "body{}"),
    ];
    assert!(store.put_all(&ns, &batch).is_err());

    let got = store.get(&ns, &page.key).unwrap().unwrap();
    assert_eq!(got.body, b"old page");
    assert_eq!(store.keys(&ns).unwrap().len(), 1);
  }

  #[test]
  fn test_concurrent_puts_to_distinct_keys() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(SqliteStore::new(db.shared()));
    let ns = CacheNamespace::new("api", 1);

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let store = Arc::clone(&store);
        let ns = ns.clone();
        std::thread::spawn(move || {
          let e = entry(&format!("https://a.test/api/item/{}", i), "v");
          store.put(&ns, &e).unwrap();
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(store.keys(&ns).unwrap().len(), 8);
  }

  #[test]
  fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edgeward.db");
    let ns = CacheNamespace::new("static", 1);
    let e = entry("https://a.test/", "<html>");

    {
      let db = Database::open_at(&path).unwrap();
      SqliteStore::new(db.shared()).put(&ns, &e).unwrap();
    }

    let db = Database::open_at(&path).unwrap();
    let got = SqliteStore::new(db.shared()).get(&ns, &e.key).unwrap();
    assert_eq!(got.map(|g| g.body), Some(b"<html>".to_vec()));
  }
}
