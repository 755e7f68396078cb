//! Write queue backends.

use chrono::{TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Mutex;
use tracing::warn;

use super::{DeferredWriteItem, WriteQueue};
use crate::db::SharedConnection;
use crate::http::Method;

/// SQLite-based write queue; survives restarts.
pub struct SqliteQueue {
  conn: SharedConnection,
}

impl SqliteQueue {
  pub fn new(conn: SharedConnection) -> Self {
    Self { conn }
  }
}

impl WriteQueue for SqliteQueue {
  fn enqueue(&self, item: &DeferredWriteItem) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let payload = serde_json::to_string(&item.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO deferred_writes (id, method, endpoint, payload, enqueued_at, attempts)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          item.id,
          item.method.as_str(),
          item.endpoint,
          payload,
          item.enqueued_at.timestamp_millis(),
          item.attempts,
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue write {}: {}", item.id, e))?;

    Ok(())
  }

  fn pending(&self) -> Result<Vec<DeferredWriteItem>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, endpoint, payload, enqueued_at, attempts FROM deferred_writes
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (String, String, String, String, i64, u32);
    let rows: Vec<Row> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query deferred writes: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read deferred write row: {}", e))?;

    // An undecodable row must not hold back the rest of the queue
    Ok(
      rows
        .into_iter()
        .filter_map(|(id, method, endpoint, payload, enqueued_at, attempts)| {
          match decode_row(id.clone(), &method, endpoint, &payload, enqueued_at, attempts) {
            Ok(item) => Some(item),
            Err(e) => {
              warn!(id = %id, error = %e, "skipping undecodable deferred write");
              None
            }
          }
        })
        .collect(),
    )
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute("DELETE FROM deferred_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove deferred write {}: {}", id, e))?;

    Ok(removed > 0)
  }

  fn record_attempt(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE deferred_writes SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))?;

    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row("SELECT COUNT(*) FROM deferred_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count deferred writes: {}", e))
  }
}

fn decode_row(
  id: String,
  method: &str,
  endpoint: String,
  payload: &str,
  enqueued_at: i64,
  attempts: u32,
) -> Result<DeferredWriteItem> {
  Ok(DeferredWriteItem {
    method: Method::parse(method)?,
    payload: serde_json::from_str(payload)
      .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", id, e))?,
    enqueued_at: Utc
      .timestamp_millis_opt(enqueued_at)
      .single()
      .ok_or_else(|| eyre!("Invalid enqueue time for {}", id))?,
    id,
    endpoint,
    attempts,
  })
}

/// In-memory write queue.
#[derive(Default)]
pub struct MemoryQueue {
  items: Mutex<Vec<DeferredWriteItem>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

impl WriteQueue for MemoryQueue {
  fn enqueue(&self, item: &DeferredWriteItem) -> Result<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if items.iter().any(|i| i.id == item.id) {
      return Err(eyre!("Deferred write {} already queued", item.id));
    }
    items.push(item.clone());
    Ok(())
  }

  fn pending(&self) -> Result<Vec<DeferredWriteItem>> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.clone())
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = items.len();
    items.retain(|i| i.id != id);
    Ok(items.len() != before)
  }

  fn record_attempt(&self, id: &str) -> Result<()> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(item) = items.iter_mut().find(|i| i.id == id) {
      item.attempts += 1;
    }
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.len())
  }
}
