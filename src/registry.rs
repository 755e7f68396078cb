//! Coexisting controller versions and which one is in charge.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::ControllerConfig;
use crate::controller::{ActiveVersion, Controller, Host};
use crate::db::SharedConnection;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::queue::{DeferredWriteItem, WriteQueue};

/// Persisted lifecycle state per controller version.
pub trait Registrations: Send + Sync + 'static {
  fn state(&self, version: u32) -> Result<Option<LifecycleState>>;

  fn set_state(&self, version: u32, state: LifecycleState) -> Result<()>;

  /// Mark `version` active and every other active version redundant, atomically.
  fn activate(&self, version: u32) -> Result<()>;

  fn active_version(&self) -> Result<Option<u32>>;
}

/// SQLite-backed registrations; survive restarts.
pub struct SqliteRegistrations {
  conn: SharedConnection,
}

impl SqliteRegistrations {
  pub fn new(conn: SharedConnection) -> Self {
    Self { conn }
  }
}

impl Registrations for SqliteRegistrations {
  fn state(&self, version: u32) -> Result<Option<LifecycleState>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM registrations WHERE version = ?",
        params![version],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read registration {}: {}", version, e))?;

    Ok(state.and_then(|s| LifecycleState::parse(&s)))
  }

  fn set_state(&self, version: u32, state: LifecycleState) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO registrations (version, state, updated_at) VALUES (?, ?, ?)",
        params![version, state.as_str(), Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to store registration {}: {}", version, e))?;

    Ok(())
  }

  fn activate(&self, version: u32) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let now = Utc::now().timestamp_millis();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE registrations SET state = ?, updated_at = ? WHERE state = ? AND version != ?",
      params![
        LifecycleState::Redundant.as_str(),
        now,
        LifecycleState::Active.as_str(),
        version
      ],
    )
    .map_err(|e| eyre!("Failed to retire previous versions: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO registrations (version, state, updated_at) VALUES (?, ?, ?)",
      params![version, LifecycleState::Active.as_str(), now],
    )
    .map_err(|e| eyre!("Failed to activate version {}: {}", version, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn active_version(&self) -> Result<Option<u32>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT version FROM registrations WHERE state = ? ORDER BY version DESC LIMIT 1",
        params![LifecycleState::Active.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }
}

/// In-memory registrations.
#[derive(Default)]
pub struct MemoryRegistrations {
  states: Mutex<BTreeMap<u32, LifecycleState>>,
}

impl MemoryRegistrations {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Registrations for MemoryRegistrations {
  fn state(&self, version: u32) -> Result<Option<LifecycleState>> {
    let states = self
      .states
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(states.get(&version).copied())
  }

  fn set_state(&self, version: u32, state: LifecycleState) -> Result<()> {
    let mut states = self
      .states
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    states.insert(version, state);
    Ok(())
  }

  fn activate(&self, version: u32) -> Result<()> {
    let mut states = self
      .states
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    for state in states.values_mut() {
      if *state == LifecycleState::Active {
        *state = LifecycleState::Redundant;
      }
    }
    states.insert(version, LifecycleState::Active);
    Ok(())
  }

  fn active_version(&self) -> Result<Option<u32>> {
    let states = self
      .states
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      states
        .iter()
        .rev()
        .find(|(_, s)| **s == LifecycleState::Active)
        .map(|(v, _)| *v),
    )
  }
}

/// Tracks every registered controller version over one shared store.
///
/// A new version installs alongside the active one and waits until it is
/// told to skip waiting or every client of the old version has gone.
pub struct Registry<S: CacheStore> {
  store: Arc<S>,
  queue: Arc<dyn WriteQueue>,
  registrations: Arc<dyn Registrations>,
  host: Host,
  active: ActiveVersion,
  controllers: Mutex<BTreeMap<u32, Controller<S>>>,
}

impl<S: CacheStore> Registry<S> {
  pub fn new(
    store: Arc<S>,
    queue: Arc<dyn WriteQueue>,
    registrations: Arc<dyn Registrations>,
    host: Host,
  ) -> Self {
    Self {
      store,
      queue,
      registrations,
      host,
      active: ActiveVersion::new(None),
      controllers: Mutex::new(BTreeMap::new()),
    }
  }

  /// Register a controller version and drive it as far as it may go.
  ///
  /// A version already recorded as active resumes without reinstalling.
  /// Otherwise it installs; if nothing else is active it activates at once.
  /// An install failure is returned and the version stays `Installing`, so
  /// calling `register` again retries it.
  pub async fn register(&self, config: Arc<ControllerConfig>) -> Result<Controller<S>> {
    let version = config.version;
    if let Some(existing) = self.controller(version)? {
      if existing.state() != LifecycleState::Installing {
        return Ok(existing);
      }
    }

    let active = self.registrations.active_version()?;
    self.active.set(active);
    let resumed = active == Some(version);
    let lifecycle = if resumed {
      info!(version, "resuming active controller");
      Lifecycle::resumed_active()
    } else {
      Lifecycle::new()
    };

    let controller = Controller::new(
      config,
      Arc::clone(&self.store),
      Arc::clone(&self.queue),
      Arc::clone(&self.registrations),
      self.host.clone(),
      self.active.clone(),
      lifecycle,
    );
    self
      .controllers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(version, controller.clone());

    if resumed {
      return Ok(controller);
    }

    controller.install().await?;

    if controller.state() == LifecycleState::Installed {
      match self.registrations.active_version()? {
        None => {
          controller.activate().await?;
        }
        Some(active) => {
          info!(version, active, "installed; waiting for clients of the active version");
        }
      }
    }

    Ok(controller)
  }

  pub fn controller(&self, version: u32) -> Result<Option<Controller<S>>> {
    let controllers = self
      .controllers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(controllers.get(&version).cloned())
  }

  /// The controller currently intercepting traffic, if it is loaded.
  pub fn active(&self) -> Result<Option<Controller<S>>> {
    match self.registrations.active_version()? {
      Some(version) => self.controller(version),
      None => Ok(None),
    }
  }

  /// The newest installed version waiting to take over.
  pub fn waiting(&self) -> Result<Option<Controller<S>>> {
    let controllers = self
      .controllers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      controllers
        .values()
        .rev()
        .find(|c| c.state() == LifecycleState::Installed)
        .cloned(),
    )
  }

  /// Queue a write without loading any controller; works while offline.
  pub fn enqueue(&self, item: DeferredWriteItem) -> Result<DeferredWriteItem> {
    self.queue.enqueue(&item)?;
    info!(id = %item.id, endpoint = %item.endpoint, "deferred write queued");
    Ok(item)
  }

  pub fn pending_writes(&self) -> Result<Vec<DeferredWriteItem>> {
    self.queue.pending()
  }

  /// Every client of the active version has closed; promote the waiting one.
  pub async fn clients_released(&self) -> Result<Option<Controller<S>>> {
    let Some(waiting) = self.waiting()? else {
      return Ok(None);
    };

    if let Err(e) = waiting.activate().await {
      warn!(version = waiting.version(), error = %e, "activation of waiting version failed");
      return Err(e);
    }
    Ok(Some(waiting))
  }
}
