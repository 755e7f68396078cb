//! Controller lifecycle: install, wait, activate.
//!
//! ```text
//! Installing --prewarm ok--> Installed --activate--> Activating --gc + claim--> Active
//!     ^  |                       |                                             |
//!     +--+ prewarm failed        +------------------ Redundant <---------------+
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::fmt;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::cache::{CacheEntry, CacheLayer, CacheNamespace, CacheStore};
use crate::config::ControllerConfig;
use crate::http::Request;
use crate::network::Network;

/// Which phase a controller version is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for the previous version to let go
  Installed,
  Activating,
  Active,
  /// Superseded by a newer version
  Redundant,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(Self::Installing),
      "installed" => Some(Self::Installed),
      "activating" => Some(Self::Activating),
      "active" => Some(Self::Active),
      "redundant" => Some(Self::Redundant),
      _ => None,
    }
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct TransitionError {
  pub from: LifecycleState,
  pub to: LifecycleState,
}

fn is_valid_transition(from: LifecycleState, to: LifecycleState) -> bool {
  use LifecycleState::*;
  matches!(
    (from, to),
    (Installing, Installed)
      | (Installed, Activating)
      | (Activating, Active)
      | (Installing | Installed | Activating | Active, Redundant)
  )
}

/// Lifecycle state of one controller version.
#[derive(Debug, Clone)]
pub struct Lifecycle {
  state: LifecycleState,
  skip_waiting: bool,
}

impl Lifecycle {
  /// Fresh registration; starts installing.
  pub fn new() -> Self {
    Self {
      state: LifecycleState::Installing,
      skip_waiting: false,
    }
  }

  /// A version that was already active before a restart.
  pub fn resumed_active() -> Self {
    Self {
      state: LifecycleState::Active,
      skip_waiting: false,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn transition(&mut self, to: LifecycleState) -> Result<(), TransitionError> {
    let from = self.state;
    if !is_valid_transition(from, to) {
      return Err(TransitionError { from, to });
    }
    self.state = to;
    info!(%from, %to, "lifecycle transition");
    Ok(())
  }

  /// Remember that activation should not wait for clients to close.
  pub fn request_skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

/// Fetch every URL and store them all, or store nothing.
///
/// Any transport failure or non-2xx status fails the whole batch before a
/// single entry is written. The batch is stored atomically, so a failed
/// write leaves earlier entries for the same keys in place.
pub async fn add_all<S: CacheStore>(
  cache: &CacheLayer<S>,
  network: &dyn Network,
  namespace: &CacheNamespace,
  urls: &[Url],
) -> Result<usize> {
  let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();
  let responses = join_all(requests.iter().map(|r| network.fetch(r))).await;

  let mut entries = Vec::with_capacity(requests.len());
  for (request, response) in requests.iter().zip(responses) {
    let response = response.map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
    if !response.ok() {
      return Err(eyre!(
        "Failed to fetch {}: status {}",
        request.url,
        response.status
      ));
    }
    entries.push(CacheEntry::from_response(request.cache_key(), &response));
  }

  let count = entries.len();
  cache.open_namespace(namespace)?;
  cache.put_all(namespace, entries).await?;
  Ok(count)
}

/// Pre-warm the static namespace with the install manifest.
pub async fn prewarm<S: CacheStore>(
  cache: &CacheLayer<S>,
  network: &dyn Network,
  config: &ControllerConfig,
) -> Result<usize> {
  let count = add_all(cache, network, &config.static_namespace(), &config.manifest).await?;
  info!(version = config.version, count, "static cache pre-warmed");
  Ok(count)
}

/// Delete every namespace that is not one of this version's three.
pub fn collect_garbage<S: CacheStore>(
  cache: &CacheLayer<S>,
  config: &ControllerConfig,
) -> Result<Vec<CacheNamespace>> {
  let keep = config.current_namespaces();
  let mut deleted = Vec::new();

  for namespace in cache.list_namespaces()? {
    if keep.contains(&namespace) {
      continue;
    }
    cache.delete_namespace(&namespace)?;
    info!(namespace = %namespace, "deleted old cache");
    deleted.push(namespace);
  }

  Ok(deleted)
}
