pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Connection handle shared by the cache store, the write queue and the registry.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Database connection wrapper for caches, deferred writes and registrations
pub struct Database {
  conn: SharedConnection,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Get a shared handle to the connection
  pub fn shared(&self) -> SharedConnection {
    Arc::clone(&self.conn)
  }
}
